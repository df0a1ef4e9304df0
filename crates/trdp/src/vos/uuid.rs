// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RFC 4122 time-based UUIDs for MD transaction identification.
//!
//! Layout: bytes 0..8 carry the second/microsecond clock with the version
//! nibble stamped into byte 7, bytes 8..10 a rolling per-process counter
//! (variant bits in byte 8), bytes 10..16 the node id. The node id is the
//! primary interface's identity; without a portable MAC source it is derived
//! from the primary IPv4 address and the process id with the multicast bit
//! set, as RFC 4122 prescribes for missing IEEE 802 addresses.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// 16-byte MD session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Uuid(pub [u8; 16]);

static CLOCK_SEQ: AtomicU16 = AtomicU16::new(0);
static NODE_ID: OnceLock<[u8; 6]> = OnceLock::new();

fn node_id() -> [u8; 6] {
    *NODE_ID.get_or_init(|| {
        let ip = local_ip_address::local_ip()
            .ok()
            .and_then(|ip| match ip {
                std::net::IpAddr::V4(v4) => Some(v4.octets()),
                std::net::IpAddr::V6(_) => None,
            })
            .unwrap_or([127, 0, 0, 1]);
        let pid = std::process::id();
        // Multicast bit marks a non-IEEE-802 node id (RFC 4122 sec. 4.5)
        [
            0x01 | (pid >> 8) as u8,
            pid as u8,
            ip[0],
            ip[1],
            ip[2],
            ip[3],
        ]
    })
}

impl Uuid {
    /// The all-zero UUID (wire value of "no session").
    pub const NIL: Uuid = Uuid([0; 16]);

    /// Generate a fresh time-based UUID.
    pub fn generate() -> Uuid {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = now.as_secs() as u32;
        let micros = now.subsec_micros();
        let seq = CLOCK_SEQ.fetch_add(1, Ordering::Relaxed);
        let node = node_id();

        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&micros.to_be_bytes());
        b[4..8].copy_from_slice(&secs.to_be_bytes());
        b[7] = (b[7] & 0x0F) | 0x40; // version 4 nibble per the TRDP profile
        b[8] = ((seq >> 8) as u8 & 0x3F) | 0x80; // RFC 4122 variant
        b[9] = seq as u8;
        b[10..16].copy_from_slice(&node);
        Uuid(b)
    }

    /// True for the all-zero UUID.
    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Raw bytes, wire order.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for Uuid {
    fn from(b: [u8; 16]) -> Self {
        Uuid(b)
    }
}

impl std::fmt::Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15]
        )
    }
}
