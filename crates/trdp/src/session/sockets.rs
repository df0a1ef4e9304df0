// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session socket pool.
//!
//! Sockets are owned here and referenced by index from publishers,
//! subscribers and MD sessions, so entity records never hold descriptors
//! themselves. Entries are shared by `(bind, port, qos, ttl)` key with
//! reference counting; the last release closes the socket.
//!
//! Each entry keeps the std socket as the primary handle plus a dup'd
//! clone registered with the session's `mio` poll (both descriptors refer
//! to the same socket, so multicast membership applies to either).

use mio::{Interest, Registry, Token};
use std::net::{Ipv4Addr, UdpSocket};

use crate::api::{Error, Result};
use crate::vos::sock::{self, SocketOptions};

/// Tokens below this are UDP pool indices; the MD TCP transport owns the
/// range above it.
pub const TOKEN_TCP_BASE: usize = 1 << 20;

/// What traffic a pooled socket carries (selects the dispatch path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    /// PD receive socket (bound to the PD port, possibly to a group).
    PdReceive,
    /// PD transmit socket (ephemeral port, never registered for read).
    PdSend,
    /// MD UDP socket (bound to the MD port, send and receive).
    MdUdp,
}

/// Pool sharing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockKey {
    /// Requested bind address (a multicast group for joined receivers).
    pub bind: Ipv4Addr,
    /// Requested port (0 = ephemeral, never shared by key).
    pub port: u16,
    /// DSCP class.
    pub qos: u8,
    /// TTL.
    pub ttl: u8,
    /// Traffic kind; sockets are never shared across kinds.
    pub kind: SockKind,
}

pub struct SockEntry {
    key: SockKey,
    std: UdpSocket,
    mio: mio::net::UdpSocket,
    refcount: u32,
    /// Multicast groups joined on this socket.
    joined: Vec<Ipv4Addr>,
}

impl SockEntry {
    /// Primary handle for send/receive/options.
    pub fn socket(&self) -> &UdpSocket {
        &self.std
    }

    /// Traffic kind.
    pub fn kind(&self) -> SockKind {
        self.key.kind
    }

    /// Joined groups (for the join statistics).
    pub fn joined(&self) -> &[Ipv4Addr] {
        &self.joined
    }
}

/// Reference-counted socket pool with stable indices.
#[derive(Default)]
pub struct SocketPool {
    entries: Vec<Option<SockEntry>>,
}

impl SocketPool {
    pub fn new() -> Self {
        SocketPool::default()
    }

    /// Get or open the socket for `key`. Receive-capable kinds are
    /// registered with `registry` under their index token.
    pub fn obtain(&mut self, key: SockKey, registry: &Registry) -> Result<usize> {
        // Ephemeral-port sends are still shared: the key matches on the
        // requested port (0), not the bound one.
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.key == key))
        {
            if let Some(entry) = self.entries[idx].as_mut() {
                entry.refcount += 1;
            }
            return Ok(idx);
        }

        let opts = SocketOptions {
            qos: key.qos,
            ttl: key.ttl,
            ..SocketOptions::default()
        };
        let std = sock::open_udp(key.bind, key.port, &opts)?;
        let mut mio_sock = mio::net::UdpSocket::from_std(std.try_clone().map_err(Error::Io)?);

        let idx = self
            .entries
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.entries.len());
        if idx >= TOKEN_TCP_BASE {
            return Err(Error::Sock("socket pool exhausted".into()));
        }

        if key.kind != SockKind::PdSend {
            registry
                .register(&mut mio_sock, Token(idx), Interest::READABLE)
                .map_err(Error::Io)?;
        }

        let entry = SockEntry {
            key,
            std,
            mio: mio_sock,
            refcount: 1,
            joined: Vec::new(),
        };
        if idx == self.entries.len() {
            self.entries.push(Some(entry));
        } else {
            self.entries[idx] = Some(entry);
        }
        Ok(idx)
    }

    /// Drop one reference; closes and deregisters on the last one.
    pub fn release(&mut self, idx: usize, registry: &Registry) {
        let Some(slot) = self.entries.get_mut(idx) else {
            return;
        };
        let Some(entry) = slot.as_mut() else {
            return;
        };
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }
        if let Some(mut entry) = slot.take() {
            if entry.key.kind != SockKind::PdSend {
                let _ = registry.deregister(&mut entry.mio);
            }
            log::debug!(
                "[SOCK] pool close bind={}:{} kind={:?}",
                entry.key.bind,
                entry.key.port,
                entry.key.kind
            );
            // std + mio handles drop here, closing the socket
        }
    }

    /// Join a multicast group on the pooled socket.
    pub fn join(&mut self, idx: usize, group: Ipv4Addr, iface: Ipv4Addr) -> Result<()> {
        let entry = self.get_mut(idx)?;
        if !entry.joined.contains(&group) {
            sock::join_mc(&entry.std, group, iface)?;
            entry.joined.push(group);
        }
        Ok(())
    }

    pub fn get(&self, idx: usize) -> Result<&SockEntry> {
        self.entries
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::Sock(format!("stale socket index {}", idx)))
    }

    fn get_mut(&mut self, idx: usize) -> Result<&mut SockEntry> {
        self.entries
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::Sock(format!("stale socket index {}", idx)))
    }

    /// All joined groups across the pool (join statistics).
    pub fn joined_groups(&self) -> Vec<Ipv4Addr> {
        let mut groups: Vec<Ipv4Addr> = self
            .entries
            .iter()
            .flatten()
            .flat_map(|e| e.joined.iter().copied())
            .collect();
        groups.sort_unstable();
        groups.dedup();
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(port: u16) -> SockKey {
        SockKey {
            bind: Ipv4Addr::LOCALHOST,
            port,
            qos: 0,
            ttl: 64,
            kind: SockKind::PdReceive,
        }
    }

    #[test]
    fn same_key_shares_one_socket() {
        let poll = mio::Poll::new().expect("poll");
        let mut pool = SocketPool::new();
        let a = pool.obtain(test_key(0), poll.registry()).expect("first");
        // port 0 requested twice: same key, shared entry
        let b = pool.obtain(test_key(0), poll.registry()).expect("second");
        assert_eq!(a, b);

        pool.release(a, poll.registry());
        assert!(pool.get(a).is_ok(), "one reference left");
        pool.release(b, poll.registry());
        assert!(pool.get(a).is_err(), "closed after last release");
    }

    #[test]
    fn different_qos_gets_its_own_socket() {
        let poll = mio::Poll::new().expect("poll");
        let mut pool = SocketPool::new();
        let a = pool.obtain(test_key(0), poll.registry()).expect("a");
        let mut key = test_key(0);
        key.qos = 7;
        let b = pool.obtain(key, poll.registry()).expect("b");
        assert_ne!(a, b);
    }

    #[test]
    fn released_slot_is_reused() {
        let poll = mio::Poll::new().expect("poll");
        let mut pool = SocketPool::new();
        let a = pool.obtain(test_key(0), poll.registry()).expect("a");
        pool.release(a, poll.registry());
        let mut key = test_key(0);
        key.ttl = 32;
        let b = pool.obtain(key, poll.registry()).expect("b");
        assert_eq!(a, b, "freed index is recycled");
    }
}
