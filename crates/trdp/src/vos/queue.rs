// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded FIFO queue over a crossbeam channel.
//!
//! The cheap MPMC handoff primitive of the OS abstraction: `send` never
//! blocks (full queues fail fast with `QueueFull`), `receive` optionally
//! waits up to a caller-supplied timeout.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::api::{Error, Result};
use crate::vos::time::TimeVal;

/// Bounded FIFO of `T` records. Clone shares the same queue.
#[derive(Clone)]
pub struct VosQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> VosQueue<T> {
    /// Create a queue holding at most `capacity` records.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Param("queue capacity must be non-zero".into()));
        }
        let (tx, rx) = bounded(capacity);
        Ok(VosQueue { tx, rx, capacity })
    }

    /// Enqueue a record; fails with `QueueFull` when at capacity.
    pub fn send(&self, item: T) -> Result<()> {
        self.tx.try_send(item).map_err(|_| Error::QueueFull)
    }

    /// Dequeue a record.
    ///
    /// `timeout = None` polls and fails immediately with `Queue` when empty;
    /// otherwise blocks up to the timeout, then fails with `Queue`.
    pub fn receive(&self, timeout: Option<TimeVal>) -> Result<T> {
        match timeout {
            None => self.rx.try_recv().map_err(|e| match e {
                TryRecvError::Empty | TryRecvError::Disconnected => Error::Queue,
            }),
            Some(tv) => self
                .rx
                .recv_timeout(tv.as_duration())
                .map_err(|e| match e {
                    RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected => Error::Queue,
                }),
        }
    }

    /// Records currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// True when no record is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
