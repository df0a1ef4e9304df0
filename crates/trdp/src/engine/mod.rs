// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Event loop plumbing
//!
//! Readiness polling behind `get_interval`/`process`. The session owns one
//! [`EventLoop`]; every engine socket registers with its registry under a
//! stable token (UDP pool index, or the MD TCP range above
//! `TOKEN_TCP_BASE`). `process` drains ready sockets and expired timers in
//! one pass; the only blocking point in the whole stack is the poll call
//! in here.

use mio::{Events, Poll, Registry};
use std::time::Duration;

use crate::api::{Result, TrdpEvent};

/// Maximum readiness events drained per poll.
const MAX_EVENTS: usize = 128;

/// One delivery produced by a `process` tick: either handed to the
/// registered callback (push model) or returned to the host (pull model).
pub(crate) struct Delivery {
    pub event: TrdpEvent,
    pub callback: bool,
}

/// Readiness of one token, decoupled from the mio event lifetime.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ready {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

/// Owned poll + event buffer.
pub(crate) struct EventLoop {
    poll: Poll,
    events: Events,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Ok(EventLoop {
            poll: Poll::new().map_err(crate::api::Error::Io)?,
            events: Events::with_capacity(MAX_EVENTS),
        })
    }

    /// Registry for socket registration.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Poll once. `timeout = Some(ZERO)` is the non-blocking host-driven
    /// mode; `None` blocks until readiness.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Ready>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(crate::api::Error::Io(e)),
        }
        Ok(self
            .events
            .iter()
            .map(|ev| Ready {
                token: ev.token().0,
                readable: ev.is_readable(),
                writable: ev.is_writable(),
            })
            .collect())
    }
}
