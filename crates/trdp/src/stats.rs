// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session statistics counters.
//!
//! Plain 32-bit counters mutated on the process thread (or under the
//! session lock from API calls) and read out as snapshots. Presentation -
//! answering the reserved statistics telegrams on the wire - is the
//! host's business; the stack only produces the numbers.

use std::net::Ipv4Addr;

use crate::api::{PubHandle, Redundancy, SubHandle, TimeoutBehaviour};
use crate::vos::mem::MemStatistics;

/// Process data counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdStatistics {
    /// Frames transmitted.
    pub sent: u32,
    /// Frames accepted and delivered to a subscriber.
    pub received: u32,
    /// Frames dropped on CRC mismatch.
    pub crc_errors: u32,
    /// Frames dropped on version/type mismatch or truncation.
    pub protocol_errors: u32,
    /// Frames dropped on topography counter mismatch.
    pub topo_errors: u32,
    /// Frames that matched no subscriber.
    pub no_subscriber: u32,
    /// Pull requests that matched no publisher.
    pub no_publisher: u32,
    /// Subscriber timeout events fired.
    pub timeouts: u32,
    /// Publisher cycles missed by more than the overdue factor.
    pub cyclic_misses: u32,
}

/// Message data counters, kept per transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct MdStatistics {
    /// Frames transmitted (retries included).
    pub sent: u32,
    /// Frames accepted and dispatched.
    pub received: u32,
    /// Frames dropped on CRC mismatch.
    pub crc_errors: u32,
    /// Frames dropped on version/type mismatch or truncation.
    pub protocol_errors: u32,
    /// Frames dropped on topography counter mismatch.
    pub topo_errors: u32,
    /// Requests that matched no listener.
    pub no_listener: u32,
    /// Transactions failed on reply timeout.
    pub reply_timeouts: u32,
    /// Transactions failed on confirm timeout.
    pub confirm_timeouts: u32,
}

/// Full session snapshot.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    /// Process data counters.
    pub pd: PdStatistics,
    /// Message data over UDP.
    pub udp_md: MdStatistics,
    /// Message data over TCP.
    pub tcp_md: MdStatistics,
    /// Memory pool counters at snapshot time.
    pub mem: MemStatistics,
}

impl Statistics {
    /// Zero every protocol counter; memory watermarks are owned by the
    /// pool and survive a reset.
    pub fn reset(&mut self) {
        self.pd = PdStatistics::default();
        self.udp_md = MdStatistics::default();
        self.tcp_md = MdStatistics::default();
    }
}

/// Per-subscriber snapshot.
#[derive(Debug, Clone)]
pub struct SubscriberStatistics {
    /// Subscriber handle.
    pub handle: SubHandle,
    /// Subscribed ComID.
    pub com_id: u32,
    /// Source filters (unspecified = wildcard).
    pub src_filters: (Ipv4Addr, Ipv4Addr),
    /// Destination address (multicast group or own address).
    pub dest_ip: Ipv4Addr,
    /// Configured timeout in microseconds (0 = none).
    pub timeout_us: u32,
    /// Behaviour on timeout.
    pub behaviour: TimeoutBehaviour,
    /// Frames accepted.
    pub num_received: u32,
    /// Timeout events fired.
    pub num_timeouts: u32,
}

/// Per-publisher snapshot.
#[derive(Debug, Clone)]
pub struct PublisherStatistics {
    /// Publisher handle.
    pub handle: PubHandle,
    /// Published ComID.
    pub com_id: u32,
    /// Destination address.
    pub dest_ip: Ipv4Addr,
    /// Cycle interval in microseconds (0 = on demand).
    pub interval_us: u32,
    /// Redundancy group (0 = none).
    pub red_id: u32,
    /// Frames transmitted.
    pub num_sent: u32,
    /// Next sequence counter to be assigned.
    pub seq_counter: u32,
}

/// Per-redundancy-group snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RedStatistics {
    /// Group id.
    pub group_id: u32,
    /// Current arbitration state.
    pub state: Redundancy,
}

/// Multicast membership snapshot.
#[derive(Debug, Clone)]
pub struct JoinStatistics {
    /// Groups currently joined.
    pub groups: Vec<Ipv4Addr>,
}
