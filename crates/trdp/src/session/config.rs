// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session configuration defaults.
//!
//! The external XML collaborator populates these structs; the stack
//! consumes them once at `Session::open`. Telegram-level parameters
//! (`Flags`, `SendParam`) override per call; these are the fallbacks.

use std::net::Ipv4Addr;

use crate::api::{Flags, TimeoutBehaviour};
use crate::protocol::constants::{MD_PORT, PD_UDP_PORT};
use crate::vos::mem::MemConfig;

/// Process-level options.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Host name announced in statistics.
    pub host_name: String,
    /// Redundancy leader host name (informational).
    pub leader_name: String,
    /// Engine cycle time in microseconds; also the `get_interval` ceiling.
    pub cycle_us: u32,
    /// Scheduling priority hint for a host-spawned engine thread.
    pub priority: u8,
    /// `process` performs its own bounded poll instead of a zero-timeout
    /// poll (blocking mode).
    pub blocking: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            host_name: String::new(),
            leader_name: String::new(),
            cycle_us: 10_000,
            priority: 64,
            blocking: false,
        }
    }
}

/// Process data defaults.
#[derive(Debug, Clone)]
pub struct PdConfig {
    /// DSCP traffic class for PD frames.
    pub qos: u8,
    /// IP TTL for PD frames.
    pub ttl: u8,
    /// Default telegram flags.
    pub flags: Flags,
    /// Default subscription timeout, microseconds (0 = no supervision).
    pub timeout_us: u32,
    /// Default behaviour when the timeout fires.
    pub timeout_behaviour: TimeoutBehaviour,
    /// UDP port for PD traffic.
    pub port: u16,
}

impl Default for PdConfig {
    fn default() -> Self {
        PdConfig {
            qos: 5,
            ttl: 64,
            flags: Flags::empty(),
            timeout_us: 100_000,
            timeout_behaviour: TimeoutBehaviour::Zero,
            port: PD_UDP_PORT,
        }
    }
}

/// Message data defaults.
#[derive(Debug, Clone)]
pub struct MdConfig {
    /// DSCP traffic class for MD frames.
    pub qos: u8,
    /// IP TTL for MD frames.
    pub ttl: u8,
    /// Reply timeout, microseconds.
    pub reply_timeout_us: u32,
    /// Confirm timeout, microseconds.
    pub confirm_timeout_us: u32,
    /// TCP connect timeout, microseconds.
    pub connect_timeout_us: u32,
    /// UDP port for MD traffic.
    pub udp_port: u16,
    /// TCP port for MD traffic.
    pub tcp_port: u16,
    /// Upper bound on concurrently open transactions.
    pub max_sessions: u32,
    /// Default UDP retransmissions before `ReplyTimeout`.
    pub retries: u8,
}

impl Default for MdConfig {
    fn default() -> Self {
        MdConfig {
            qos: 3,
            ttl: 64,
            reply_timeout_us: 5_000_000,
            confirm_timeout_us: 1_000_000,
            connect_timeout_us: 60_000_000,
            udp_port: MD_PORT,
            tcp_port: MD_PORT,
            max_sessions: 64,
            retries: 0,
        }
    }
}

/// Everything `Session::open` needs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Own interface address; `UNSPECIFIED` selects the primary interface.
    pub own_ip: Ipv4Addr,
    /// Redundancy leader address (informational).
    pub leader_ip: Ipv4Addr,
    /// Process options.
    pub process: ProcessConfig,
    /// PD defaults.
    pub pd: PdConfig,
    /// MD defaults.
    pub md: MdConfig,
    /// Memory pool configuration.
    pub mem: MemConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            own_ip: Ipv4Addr::UNSPECIFIED,
            leader_ip: Ipv4Addr::UNSPECIFIED,
            process: ProcessConfig::default(),
            pd: PdConfig::default(),
            md: MdConfig::default(),
            mem: MemConfig::default(),
        }
    }
}
