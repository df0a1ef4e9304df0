// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # TRDP - Train Real-time Data Protocol
//!
//! A pure Rust implementation of the IEC 61375-2-3 Train Real-time Data
//! Protocol for Ethernet train backbones: cyclic **process data** (PD)
//! with timeout-based liveness and redundancy arbitration, and
//! transactional **message data** (MD) with retries and confirmations,
//! over UDP and TCP.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::net::Ipv4Addr;
//! use trdp::{Flags, Session, SessionConfig, TimeoutBehaviour};
//!
//! fn main() -> trdp::Result<()> {
//!     let session = Session::open(SessionConfig::default())?;
//!
//!     // Publish ComID 1000 every 100 ms
//!     session.publish(
//!         1000,
//!         Ipv4Addr::UNSPECIFIED,
//!         Ipv4Addr::new(239, 1, 1, 1),
//!         100_000,
//!         0,
//!         Flags::empty(),
//!         &[0xDE, 0xAD, 0xBE, 0xEF],
//!     )?;
//!
//!     // Subscribe to the same ComID from anywhere
//!     session.subscribe(
//!         1000,
//!         Ipv4Addr::UNSPECIFIED,
//!         Ipv4Addr::UNSPECIFIED,
//!         Ipv4Addr::new(239, 1, 1, 1),
//!         200_000,
//!         TimeoutBehaviour::Zero,
//!         Flags::empty(),
//!     )?;
//!
//!     loop {
//!         for event in session.process()? {
//!             println!("{:?}", event);
//!         }
//!         std::thread::sleep(session.get_interval()?);
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |     publish/put/subscribe | notify/request/reply/confirm           |
//! +--------------------------------------------------------------------+
//! |                           Session                                  |
//! |  config defaults | socket pool | statistics | redundancy | topo    |
//! +--------------------------------------------------------------------+
//! |        PD engine             |            MD engine                |
//! |  cyclic scheduler, timeouts  |  session table, retries, deadlines  |
//! +--------------------------------------------------------------------+
//! |          Framing codec (CRC32)  |  Dataset marshaller              |
//! +--------------------------------------------------------------------+
//! |                    VOS (OS abstraction)                            |
//! |   time | memory pool | queue | sync | uuid | sockets | poll        |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Session`] | Per-host engine instance, factory for all entities |
//! | [`TrdpEvent`] | Delivery event returned by `process` (pull model) |
//! | [`Flags`] | Per-telegram options (marshalling, callback, TCP) |
//! | [`MarshalConfig`] | Dataset schema registry for payload marshalling |
//! | [`Error`] | Flat error taxonomy across all layers |
//!
//! ## Concurrency model
//!
//! The engine is single-threaded cooperative: all protocol state advances
//! inside [`Session::process`]. The host either drives `process` from its
//! own loop (use [`Session::get_interval`] for the sleep) or configures
//! blocking mode and lets `process` wait internally. API calls are safe
//! from any thread; user callbacks run on the `process` thread and must
//! not re-enter `process`.

/// Public API types: error taxonomy, flags, handles, events.
pub mod api;
/// Event loop plumbing (readiness polling).
pub(crate) mod engine;
/// Log backend bridging into the `log` facade.
pub mod logging;
/// Schema-driven dataset marshaller.
pub mod marshal;
/// MD engine (request/notify/reply/confirm state machine).
mod md;
/// PD engine (cyclic scheduler, subscriber matching).
mod pd;
/// Framing codec (constants, CRC32, PD/MD frame shapes).
pub mod protocol;
/// Application session (the per-host entry point).
pub mod session;
/// Statistics counters and snapshots.
pub mod stats;
/// OS abstraction (time, memory, queue, sync, uuid, sockets).
pub mod vos;

pub use api::{
    Error, EventResult, Flags, ListenerHandle, MdInfo, PdInfo, PubHandle, Redundancy, ReplyStatus,
    Result, SendParam, SubHandle, TimeoutBehaviour, TrdpEvent,
};
pub use marshal::{Dataset, Element, ElementType, MarshalConfig, TypeCode};
pub use session::config::{MdConfig, PdConfig, ProcessConfig, SessionConfig};
pub use session::Session;
pub use stats::Statistics;
pub use vos::mem::MemConfig;
pub use vos::time::TimeVal;
pub use vos::uuid::Uuid;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static INITIALISED: AtomicBool = AtomicBool::new(false);

/// Stack version numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

/// Stack version.
pub fn version() -> Version {
    Version {
        major: 0,
        minor: 9,
        patch: 2,
    }
}

/// Stack version as the Cargo package string.
pub fn version_string() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Process-wide initialisation: installs the optional log output.
///
/// Call once before the first `Session::open`; a second call without an
/// intervening [`terminate`] fails with `Init`. Hosts running their own
/// `log` backend pass `None`.
pub fn init(logger: Option<Arc<dyn logging::Output>>, level: logging::LogLevel) -> Result<()> {
    if INITIALISED.swap(true, Ordering::SeqCst) {
        return Err(Error::Init);
    }
    if let Some(output) = logger {
        logging::init_logging(output, level);
    }
    log::info!("[SESSION] TRDP stack v{} initialised", version_string());
    Ok(())
}

/// Process-wide finalisation: flushes logging and re-arms [`init`].
pub fn terminate() -> Result<()> {
    if !INITIALISED.swap(false, Ordering::SeqCst) {
        return Err(Error::NoInit);
    }
    log::logger().flush();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_package() {
        let v = version();
        assert_eq!(
            format!("{}.{}.{}", v.major, v.minor, v.patch),
            version_string()
        );
    }

    #[test]
    fn init_terminate_lifecycle() {
        init(None, logging::LogLevel::Warning).expect("first init");
        assert!(matches!(init(None, logging::LogLevel::Warning), Err(Error::Init)));
        terminate().expect("terminate");
        assert!(matches!(terminate(), Err(Error::NoInit)));
        init(None, logging::LogLevel::Warning).expect("re-init");
        terminate().expect("terminate again");
    }
}
