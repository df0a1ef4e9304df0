// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # PD engine
//!
//! Fixed-cycle transmit scheduler and subscriber matching for cyclic
//! process data.
//!
//! Send side: every publisher whose deadline passed and whose redundancy
//! group holds leadership gets one frame per cycle, sequence counter
//! incremented per frame. A publisher overdue by more than ten intervals
//! is resynchronized to `now + interval` and the miss is counted.
//!
//! Receive side: frames are matched by ComID and source filter per
//! receiving socket; stale or duplicate sequence counters (32-bit signed
//! difference) are dropped silently; accepted frames refresh the
//! subscriber's cache and rearm its timeout.
//!
//! Pull: a `Pr` request makes the matching publisher emit a one-shot `Pp`
//! reply; on the requesting side the pull rides an existing subscriber
//! with a one-shot deadline.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::api::{
    Error, EventResult, Flags, PdInfo, PubHandle, Redundancy, Result, SubHandle, TimeoutBehaviour,
    TrdpEvent,
};
use crate::engine::Delivery;
use crate::marshal::MarshalConfig;
use crate::protocol::constants::{MSG_PD, MSG_PE, MSG_PP, MSG_PR, PD_OVERDUE_FACTOR};
use crate::protocol::pd::PdHeader;
use crate::session::sockets::SocketPool;
use crate::stats::{PdStatistics, PublisherStatistics, SubscriberStatistics};
use crate::vos::sock;
use crate::vos::time::TimeVal;

/// One registered publisher.
pub(crate) struct Publisher {
    pub com_id: u32,
    pub dest: SocketAddrV4,
    /// Cycle interval; `ZERO` marks a pull-only publisher.
    pub interval: TimeVal,
    pub flags: Flags,
    pub red_id: u32,
    /// Last assigned sequence counter (incremented before each send).
    pub seq: u32,
    pub next_at: TimeVal,
    /// Wire-ready payload (marshalling already applied).
    pub payload: Vec<u8>,
    pub sock: usize,
    pub num_sent: u32,
}

/// One registered subscriber.
pub(crate) struct Subscriber {
    pub com_id: u32,
    pub src1: Ipv4Addr,
    pub src2: Ipv4Addr,
    pub dest: Ipv4Addr,
    /// Supervision interval; `ZERO` disables the timeout.
    pub timeout: TimeVal,
    pub behaviour: TimeoutBehaviour,
    pub flags: Flags,
    pub sock: usize,
    /// Absolute timeout deadline; `ZERO` = unarmed.
    pub deadline: TimeVal,
    /// Latch so one timeout event fires exactly once per dry spell.
    pub timed_out: bool,
    /// Pull reply pending: the next accepted frame or timeout ends it.
    pub one_shot: bool,
    /// Last accepted sequence counter per source address.
    pub last_seq: HashMap<Ipv4Addr, u32>,
    pub last_payload: Vec<u8>,
    pub last_info: Option<PdInfo>,
    pub num_received: u32,
    pub num_timeouts: u32,
}

/// Publisher/subscriber tables with stable indices.
#[derive(Default)]
pub(crate) struct PdEngine {
    publishers: Vec<Option<Publisher>>,
    subscribers: Vec<Option<Subscriber>>,
}

fn info_from_header(h: &PdHeader, src_ip: Ipv4Addr, dest: Ipv4Addr) -> PdInfo {
    PdInfo {
        com_id: h.com_id,
        src_ip,
        dst_ip: dest,
        etb_topo_cnt: h.etb_topo_cnt,
        op_trn_topo_cnt: h.op_trn_topo_cnt,
        seq_count: h.sequence_counter,
        protocol_version: h.protocol_version,
        msg_type: h.msg_type,
        reply_com_id: h.reply_com_id,
        reply_ip: h.reply_ip,
    }
}

impl PdEngine {
    pub fn new() -> Self {
        PdEngine::default()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub fn add_publisher(&mut self, publisher: Publisher) -> PubHandle {
        let idx = self
            .publishers
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.publishers.len());
        if idx == self.publishers.len() {
            self.publishers.push(Some(publisher));
        } else {
            self.publishers[idx] = Some(publisher);
        }
        PubHandle(idx as u32)
    }

    pub fn publisher_mut(&mut self, handle: PubHandle) -> Result<&mut Publisher> {
        self.publishers
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::NoPublisher)
    }

    pub fn remove_publisher(&mut self, handle: PubHandle) -> Result<Publisher> {
        self.publishers
            .get_mut(handle.0 as usize)
            .and_then(Option::take)
            .ok_or(Error::NoPublisher)
    }

    pub fn add_subscriber(&mut self, subscriber: Subscriber) -> SubHandle {
        let idx = self
            .subscribers
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.subscribers.len());
        if idx == self.subscribers.len() {
            self.subscribers.push(Some(subscriber));
        } else {
            self.subscribers[idx] = Some(subscriber);
        }
        SubHandle(idx as u32)
    }

    pub fn subscriber_mut(&mut self, handle: SubHandle) -> Result<&mut Subscriber> {
        self.subscribers
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(Error::NoSubscriber)
    }

    pub fn remove_subscriber(&mut self, handle: SubHandle) -> Result<Subscriber> {
        self.subscribers
            .get_mut(handle.0 as usize)
            .and_then(Option::take)
            .ok_or(Error::NoSubscriber)
    }

    // ========================================================================
    // Send scheduler
    // ========================================================================

    /// Transmit every due publisher whose group holds leadership.
    pub fn tick_send(
        &mut self,
        now: TimeVal,
        topo: (u32, u32),
        red: &HashMap<u32, Redundancy>,
        pool: &SocketPool,
        stats: &mut PdStatistics,
    ) {
        for publisher in self.publishers.iter_mut().flatten() {
            if publisher.interval.is_zero() || now < publisher.next_at {
                continue;
            }

            let follower = publisher.red_id != 0
                && red.get(&publisher.red_id).copied() == Some(Redundancy::Follower);
            if follower {
                // Keep cadence while suppressed so leadership handover
                // resumes on the very next cycle.
                while publisher.next_at <= now {
                    publisher.next_at += publisher.interval;
                }
                continue;
            }

            let overdue_limit = publisher.next_at + publisher.interval.scale(PD_OVERDUE_FACTOR);
            if now > overdue_limit {
                log::warn!(
                    "[PD] comId {} overdue by >{}x interval, resynchronizing",
                    publisher.com_id,
                    PD_OVERDUE_FACTOR
                );
                stats.cyclic_misses += 1;
                publisher.next_at = now + publisher.interval;
            } else {
                publisher.next_at += publisher.interval;
            }

            publisher.seq = publisher.seq.wrapping_add(1);
            let header = PdHeader::data(publisher.com_id, publisher.seq, topo);
            match header.pack(&publisher.payload) {
                Ok(frame) => match pool
                    .get(publisher.sock)
                    .and_then(|e| sock::send_udp(e.socket(), &frame, publisher.dest))
                {
                    Ok(_) => {
                        stats.sent += 1;
                        publisher.num_sent += 1;
                    }
                    Err(e) => {
                        stats.cyclic_misses += 1;
                        log::warn!("[PD] send comId {} -> {}: {}", publisher.com_id, publisher.dest, e);
                    }
                },
                Err(e) => {
                    stats.cyclic_misses += 1;
                    log::warn!("[PD] pack comId {}: {}", publisher.com_id, e);
                }
            }
        }
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Parse and dispatch one received datagram.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_datagram(
        &mut self,
        sock_idx: usize,
        src_ip: Ipv4Addr,
        buf: &[u8],
        now: TimeVal,
        topo: (u32, u32),
        pd_port: u16,
        marshal: &MarshalConfig,
        pool: &SocketPool,
        stats: &mut PdStatistics,
        out: &mut Vec<Delivery>,
    ) {
        let (header, body) = match PdHeader::parse(buf, topo) {
            Ok(ok) => ok,
            Err(Error::Crc) => {
                stats.crc_errors += 1;
                return;
            }
            Err(Error::Topo) => {
                stats.topo_errors += 1;
                return;
            }
            Err(_) => {
                stats.protocol_errors += 1;
                return;
            }
        };

        match header.msg_type {
            MSG_PR => self.handle_pull_request(&header, src_ip, topo, pd_port, pool, stats),
            MSG_PE => {
                log::debug!("[PD] Pe indication for comId {} from {}", header.com_id, src_ip);
            }
            MSG_PD | MSG_PP => {
                self.deliver(sock_idx, &header, body, src_ip, now, marshal, stats, out);
            }
            _ => stats.protocol_errors += 1,
        }
    }

    fn handle_pull_request(
        &mut self,
        header: &PdHeader,
        src_ip: Ipv4Addr,
        topo: (u32, u32),
        pd_port: u16,
        pool: &SocketPool,
        stats: &mut PdStatistics,
    ) {
        let Some(publisher) = self
            .publishers
            .iter_mut()
            .flatten()
            .find(|p| p.com_id == header.com_id)
        else {
            stats.no_publisher += 1;
            log::debug!("[PD] Pr for unknown comId {} from {}", header.com_id, src_ip);
            return;
        };

        let reply_com = if header.reply_com_id != 0 {
            header.reply_com_id
        } else {
            header.com_id
        };
        let reply_ip = if header.reply_ip.is_unspecified() {
            src_ip
        } else {
            header.reply_ip
        };

        publisher.seq = publisher.seq.wrapping_add(1);
        let mut reply = PdHeader::data(reply_com, publisher.seq, topo);
        reply.msg_type = MSG_PP;
        let dest = SocketAddrV4::new(reply_ip, pd_port);
        match reply.pack(&publisher.payload).and_then(|frame| {
            pool.get(publisher.sock)
                .and_then(|e| sock::send_udp(e.socket(), &frame, dest))
        }) {
            Ok(_) => {
                stats.sent += 1;
                publisher.num_sent += 1;
            }
            Err(e) => log::warn!("[PD] Pp reply comId {} -> {}: {}", reply_com, dest, e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &mut self,
        sock_idx: usize,
        header: &PdHeader,
        body: &[u8],
        src_ip: Ipv4Addr,
        now: TimeVal,
        marshal: &MarshalConfig,
        stats: &mut PdStatistics,
        out: &mut Vec<Delivery>,
    ) {
        let mut matched = false;
        let mut accepted = false;

        for (idx, slot) in self.subscribers.iter_mut().enumerate() {
            let Some(sub) = slot else { continue };
            if sub.sock != sock_idx || sub.com_id != header.com_id {
                continue;
            }
            let src_ok = (sub.src1.is_unspecified() && sub.src2.is_unspecified())
                || sub.src1 == src_ip
                || sub.src2 == src_ip;
            if !src_ok {
                continue;
            }
            matched = true;

            // Ordering per (comId, srcIP) flow, 32-bit signed sense;
            // duplicates and stale frames vanish without a trace.
            if let Some(&last) = sub.last_seq.get(&src_ip) {
                let diff = header.sequence_counter.wrapping_sub(last) as i32;
                if diff <= 0 {
                    continue;
                }
            }

            let payload = if sub.flags.contains(Flags::MARSHALL) && marshal.has_com_id(sub.com_id)
            {
                match marshal.unmarshal(sub.com_id, body) {
                    Ok(host) => host,
                    Err(e) => {
                        log::debug!("[PD] unmarshal comId {}: {}", sub.com_id, e);
                        stats.protocol_errors += 1;
                        continue;
                    }
                }
            } else {
                body.to_vec()
            };

            sub.last_seq.insert(src_ip, header.sequence_counter);
            sub.num_received += 1;
            accepted = true;

            let info = info_from_header(header, src_ip, sub.dest);
            sub.last_payload = payload.clone();
            sub.last_info = Some(info.clone());
            sub.timed_out = false;
            if sub.one_shot {
                // Pull satisfied: supervision ends with this reply
                sub.one_shot = false;
                sub.deadline = TimeVal::ZERO;
            } else if !sub.timeout.is_zero() {
                sub.deadline = now + sub.timeout;
            }

            out.push(Delivery {
                event: TrdpEvent::Pd {
                    handle: SubHandle(idx as u32),
                    info,
                    payload,
                    result: EventResult::Ok,
                },
                callback: sub.flags.contains(Flags::CALLBACK),
            });
        }

        if !matched {
            stats.no_subscriber += 1;
        } else if accepted {
            stats.received += 1;
        }
    }

    // ========================================================================
    // Timeout supervision
    // ========================================================================

    /// Fire expired subscriber timeouts, exactly once per dry spell.
    pub fn tick_timeouts(
        &mut self,
        now: TimeVal,
        stats: &mut PdStatistics,
        out: &mut Vec<Delivery>,
    ) {
        for (idx, slot) in self.subscribers.iter_mut().enumerate() {
            let Some(sub) = slot else { continue };
            if sub.deadline.is_zero() || sub.timed_out || now < sub.deadline {
                continue;
            }
            sub.timed_out = true;
            sub.num_timeouts += 1;
            stats.timeouts += 1;

            if sub.behaviour == TimeoutBehaviour::Zero {
                sub.last_payload.fill(0);
            }
            if sub.one_shot {
                sub.one_shot = false;
                sub.deadline = TimeVal::ZERO;
            }

            let info = sub.last_info.clone().unwrap_or(PdInfo {
                com_id: sub.com_id,
                src_ip: Ipv4Addr::UNSPECIFIED,
                dst_ip: sub.dest,
                etb_topo_cnt: 0,
                op_trn_topo_cnt: 0,
                seq_count: 0,
                protocol_version: crate::protocol::constants::PROTOCOL_VERSION,
                msg_type: MSG_PD,
                reply_com_id: 0,
                reply_ip: Ipv4Addr::UNSPECIFIED,
            });
            out.push(Delivery {
                event: TrdpEvent::Pd {
                    handle: SubHandle(idx as u32),
                    info,
                    payload: sub.last_payload.clone(),
                    result: EventResult::Timeout,
                },
                callback: sub.flags.contains(Flags::CALLBACK),
            });
        }
    }

    /// Earliest pending deadline (send or timeout) for `get_interval`.
    pub fn next_deadline(&self) -> Option<TimeVal> {
        let sends = self
            .publishers
            .iter()
            .flatten()
            .filter(|p| !p.interval.is_zero())
            .map(|p| p.next_at);
        let timeouts = self
            .subscribers
            .iter()
            .flatten()
            .filter(|s| !s.deadline.is_zero() && !s.timed_out)
            .map(|s| s.deadline);
        sends.chain(timeouts).min()
    }

    // ========================================================================
    // Pull request (subscriber side)
    // ========================================================================

    /// Send a `Pr` toward a publisher and arm the one-shot reply window on
    /// the given subscriber.
    #[allow(clippy::too_many_arguments)]
    pub fn pull_request(
        &mut self,
        handle: SubHandle,
        com_id: u32,
        reply_com_id: u32,
        dest: SocketAddrV4,
        reply_timeout: TimeVal,
        own_ip: Ipv4Addr,
        now: TimeVal,
        topo: (u32, u32),
        pool: &SocketPool,
        stats: &mut PdStatistics,
    ) -> Result<()> {
        let sub = self.subscriber_mut(handle)?;
        let mut header = PdHeader::data(com_id, 0, topo);
        header.msg_type = MSG_PR;
        header.reply_com_id = reply_com_id;
        header.reply_ip = own_ip;
        let frame = header.pack(&[])?;
        let entry = pool.get(sub.sock)?;
        sock::send_udp(entry.socket(), &frame, dest)?;
        stats.sent += 1;

        sub.one_shot = true;
        sub.timed_out = false;
        sub.deadline = now + reply_timeout;
        Ok(())
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn subscriber_statistics(&self) -> Vec<SubscriberStatistics> {
        self.subscribers
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let s = slot.as_ref()?;
                Some(SubscriberStatistics {
                    handle: SubHandle(idx as u32),
                    com_id: s.com_id,
                    src_filters: (s.src1, s.src2),
                    dest_ip: s.dest,
                    timeout_us: s.timeout.as_micros() as u32,
                    behaviour: s.behaviour,
                    num_received: s.num_received,
                    num_timeouts: s.num_timeouts,
                })
            })
            .collect()
    }

    #[cfg(test)]
    pub fn publishers_next_at_for_test(&self, handle: PubHandle) -> Option<TimeVal> {
        self.publishers
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .map(|p| p.next_at)
    }

    pub fn publisher_statistics(&self) -> Vec<PublisherStatistics> {
        self.publishers
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let p = slot.as_ref()?;
                Some(PublisherStatistics {
                    handle: PubHandle(idx as u32),
                    com_id: p.com_id,
                    dest_ip: *p.dest.ip(),
                    interval_us: p.interval.as_micros() as u32,
                    red_id: p.red_id,
                    num_sent: p.num_sent,
                    seq_counter: p.seq,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::sockets::{SockKey, SockKind};

    fn test_pool() -> (mio::Poll, SocketPool, usize) {
        let poll = mio::Poll::new().expect("poll");
        let mut pool = SocketPool::new();
        let idx = pool
            .obtain(
                SockKey {
                    bind: Ipv4Addr::LOCALHOST,
                    port: 0,
                    qos: 0,
                    ttl: 64,
                    kind: SockKind::PdSend,
                },
                poll.registry(),
            )
            .expect("socket");
        (poll, pool, idx)
    }

    fn test_subscriber(sock: usize, com_id: u32) -> Subscriber {
        Subscriber {
            com_id,
            src1: Ipv4Addr::UNSPECIFIED,
            src2: Ipv4Addr::UNSPECIFIED,
            dest: Ipv4Addr::LOCALHOST,
            timeout: TimeVal::from_millis(200),
            behaviour: TimeoutBehaviour::Zero,
            flags: Flags::empty(),
            sock,
            deadline: TimeVal::ZERO,
            timed_out: false,
            one_shot: false,
            last_seq: HashMap::new(),
            last_payload: Vec::new(),
            last_info: None,
            num_received: 0,
            num_timeouts: 0,
        }
    }

    fn data_frame(com_id: u32, seq: u32, payload: &[u8]) -> Vec<u8> {
        PdHeader::data(com_id, seq, (0, 0)).pack(payload).expect("pack")
    }

    fn feed(
        engine: &mut PdEngine,
        sock: usize,
        src: Ipv4Addr,
        frame: &[u8],
        now: TimeVal,
        pool: &SocketPool,
        stats: &mut PdStatistics,
        out: &mut Vec<Delivery>,
    ) {
        let marshal = MarshalConfig::new();
        engine.handle_datagram(sock, src, frame, now, (0, 0), 17224, &marshal, pool, stats, out);
    }

    #[test]
    fn matching_frame_is_delivered_and_cached() {
        let (_poll, pool, sock) = test_pool();
        let mut engine = PdEngine::new();
        let h = engine.add_subscriber(test_subscriber(sock, 1000));

        let mut stats = PdStatistics::default();
        let mut out = Vec::new();
        let now = TimeVal::new(10, 0);
        feed(
            &mut engine,
            sock,
            Ipv4Addr::new(10, 0, 0, 1),
            &data_frame(1000, 1, &[0xDE, 0xAD, 0xBE, 0xEF]),
            now,
            &pool,
            &mut stats,
            &mut out,
        );

        assert_eq!(out.len(), 1);
        match &out[0].event {
            TrdpEvent::Pd {
                handle,
                payload,
                result,
                ..
            } => {
                assert_eq!(*handle, h);
                assert_eq!(payload, &[0xDE, 0xAD, 0xBE, 0xEF]);
                assert_eq!(*result, EventResult::Ok);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(stats.received, 1);
        let sub = engine.subscriber_mut(h).expect("sub");
        assert_eq!(sub.last_payload, [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(sub.deadline, now + TimeVal::from_millis(200));
    }

    #[test]
    fn stale_and_duplicate_sequences_are_dropped() {
        let (_poll, pool, sock) = test_pool();
        let mut engine = PdEngine::new();
        engine.add_subscriber(test_subscriber(sock, 1000));
        let src = Ipv4Addr::new(10, 0, 0, 1);

        let mut stats = PdStatistics::default();
        let mut out = Vec::new();
        let now = TimeVal::new(1, 0);
        for seq in [5u32, 5, 4, 6] {
            feed(&mut engine, sock, src, &data_frame(1000, seq, &[1, 2, 3, 4]), now, &pool, &mut stats, &mut out);
        }
        // 5 accepted, 5 dup dropped, 4 stale dropped, 6 accepted
        assert_eq!(out.len(), 2);
        assert_eq!(stats.received, 2);
    }

    #[test]
    fn sequence_wraparound_is_signed() {
        let (_poll, pool, sock) = test_pool();
        let mut engine = PdEngine::new();
        engine.add_subscriber(test_subscriber(sock, 1000));
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let mut stats = PdStatistics::default();
        let mut out = Vec::new();
        let now = TimeVal::new(1, 0);

        feed(&mut engine, sock, src, &data_frame(1000, u32::MAX, &[1, 2, 3, 4]), now, &pool, &mut stats, &mut out);
        // 0 follows u32::MAX in the signed sense
        feed(&mut engine, sock, src, &data_frame(1000, 0, &[1, 2, 3, 4]), now, &pool, &mut stats, &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn source_filter_matches_either_or_wildcard() {
        let (_poll, pool, sock) = test_pool();
        let mut engine = PdEngine::new();
        let mut sub = test_subscriber(sock, 1000);
        sub.src1 = Ipv4Addr::new(10, 0, 0, 1);
        sub.src2 = Ipv4Addr::new(10, 0, 0, 2);
        engine.add_subscriber(sub);

        let mut stats = PdStatistics::default();
        let mut out = Vec::new();
        let now = TimeVal::new(1, 0);
        feed(&mut engine, sock, Ipv4Addr::new(10, 0, 0, 1), &data_frame(1000, 1, &[1, 2, 3, 4]), now, &pool, &mut stats, &mut out);
        feed(&mut engine, sock, Ipv4Addr::new(10, 0, 0, 2), &data_frame(1000, 2, &[1, 2, 3, 4]), now, &pool, &mut stats, &mut out);
        feed(&mut engine, sock, Ipv4Addr::new(10, 0, 0, 3), &data_frame(1000, 3, &[1, 2, 3, 4]), now, &pool, &mut stats, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(stats.no_subscriber, 1);
    }

    #[test]
    fn corrupt_frames_count_and_vanish() {
        let (_poll, pool, sock) = test_pool();
        let mut engine = PdEngine::new();
        engine.add_subscriber(test_subscriber(sock, 1000));

        let mut stats = PdStatistics::default();
        let mut out = Vec::new();
        let mut frame = data_frame(1000, 1, &[1, 2, 3, 4]);
        frame[9] ^= 0xFF;
        feed(&mut engine, sock, Ipv4Addr::LOCALHOST, &frame, TimeVal::new(1, 0), &pool, &mut stats, &mut out);
        assert!(out.is_empty());
        assert_eq!(stats.crc_errors, 1);
    }

    #[test]
    fn timeout_fires_exactly_once_and_zeroes() {
        let (_poll, pool, sock) = test_pool();
        let mut engine = PdEngine::new();
        let h = engine.add_subscriber(test_subscriber(sock, 1000));

        let mut stats = PdStatistics::default();
        let mut out = Vec::new();
        let t0 = TimeVal::new(5, 0);
        feed(&mut engine, sock, Ipv4Addr::new(10, 0, 0, 1), &data_frame(1000, 1, &[1, 2, 3, 4]), t0, &pool, &mut stats, &mut out);
        out.clear();

        // Before the deadline: nothing
        engine.tick_timeouts(t0 + TimeVal::from_millis(100), &mut stats, &mut out);
        assert!(out.is_empty());

        // After: exactly one Timeout with zeroed payload
        let late = t0 + TimeVal::from_millis(250);
        engine.tick_timeouts(late, &mut stats, &mut out);
        engine.tick_timeouts(late + TimeVal::from_millis(500), &mut stats, &mut out);
        assert_eq!(out.len(), 1);
        match &out[0].event {
            TrdpEvent::Pd { payload, result, .. } => {
                assert_eq!(*result, EventResult::Timeout);
                assert_eq!(payload, &[0, 0, 0, 0]);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(stats.timeouts, 1);

        // A fresh frame rearms the supervision
        out.clear();
        let t1 = late + TimeVal::new(1, 0);
        feed(&mut engine, sock, Ipv4Addr::new(10, 0, 0, 1), &data_frame(1000, 2, &[5, 6, 7, 8]), t1, &pool, &mut stats, &mut out);
        assert_eq!(out.len(), 1);
        engine.tick_timeouts(t1 + TimeVal::from_millis(250), &mut stats, &mut out);
        assert_eq!(stats.timeouts, 2);
        let sub = engine.subscriber_mut(h).expect("sub");
        assert_eq!(sub.num_timeouts, 2);
    }

    #[test]
    fn keep_last_retains_payload_on_timeout() {
        let (_poll, pool, sock) = test_pool();
        let mut engine = PdEngine::new();
        let mut sub = test_subscriber(sock, 1000);
        sub.behaviour = TimeoutBehaviour::KeepLast;
        engine.add_subscriber(sub);

        let mut stats = PdStatistics::default();
        let mut out = Vec::new();
        let t0 = TimeVal::new(5, 0);
        feed(&mut engine, sock, Ipv4Addr::new(10, 0, 0, 1), &data_frame(1000, 1, &[9, 8, 7, 6]), t0, &pool, &mut stats, &mut out);
        out.clear();
        engine.tick_timeouts(t0 + TimeVal::new(1, 0), &mut stats, &mut out);
        match &out[0].event {
            TrdpEvent::Pd { payload, result, .. } => {
                assert_eq!(*result, EventResult::Timeout);
                assert_eq!(payload, &[9, 8, 7, 6]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn follower_suppresses_but_keeps_cadence() {
        let (_poll, pool, sock) = test_pool();
        let mut engine = PdEngine::new();
        let interval = TimeVal::from_millis(100);
        let t0 = TimeVal::new(1, 0);
        engine.add_publisher(Publisher {
            com_id: 1000,
            dest: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 59999),
            interval,
            flags: Flags::empty(),
            red_id: 5,
            seq: 0,
            next_at: t0,
            payload: vec![1, 2, 3, 4],
            sock,
            num_sent: 0,
        });

        let mut stats = PdStatistics::default();
        let mut red = HashMap::new();
        red.insert(5u32, Redundancy::Follower);

        engine.tick_send(t0 + interval, (0, 0), &red, &pool, &mut stats);
        assert_eq!(stats.sent, 0, "follower must not emit");

        red.insert(5, Redundancy::Leader);
        engine.tick_send(t0 + interval.scale(2), (0, 0), &red, &pool, &mut stats);
        assert_eq!(stats.sent, 1, "leader resumes on next cycle");
    }

    #[test]
    fn sequence_increases_per_transmission() {
        let (_poll, pool, sock) = test_pool();
        let mut engine = PdEngine::new();
        let interval = TimeVal::from_millis(10);
        let t0 = TimeVal::new(1, 0);
        let h = engine.add_publisher(Publisher {
            com_id: 1000,
            dest: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 59998),
            interval,
            flags: Flags::empty(),
            red_id: 0,
            seq: 0,
            next_at: t0,
            payload: vec![0; 4],
            sock,
            num_sent: 0,
        });

        let mut stats = PdStatistics::default();
        let red = HashMap::new();
        for k in 1..=5u32 {
            engine.tick_send(t0 + interval.scale(k), (0, 0), &red, &pool, &mut stats);
        }
        let p = engine.publisher_mut(h).expect("pub");
        assert_eq!(p.num_sent, 5);
        assert_eq!(p.seq, 5, "k-th frame carries sequence k");
    }

    #[test]
    fn overdue_publisher_is_resynchronized() {
        let (_poll, pool, sock) = test_pool();
        let mut engine = PdEngine::new();
        let interval = TimeVal::from_millis(100);
        let t0 = TimeVal::new(1, 0);
        let h = engine.add_publisher(Publisher {
            com_id: 1000,
            dest: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 59997),
            interval,
            flags: Flags::empty(),
            red_id: 0,
            seq: 0,
            next_at: t0,
            payload: vec![0; 4],
            sock,
            num_sent: 0,
        });

        let mut stats = PdStatistics::default();
        let red = HashMap::new();
        let late = t0 + interval.scale(20);
        engine.tick_send(late, (0, 0), &red, &pool, &mut stats);
        assert_eq!(stats.cyclic_misses, 1);
        let p = engine.publisher_mut(h).expect("pub");
        assert_eq!(p.next_at, late + interval);
    }

    #[test]
    fn next_deadline_is_the_minimum() {
        let (_poll, pool, sock) = test_pool();
        let _ = pool;
        let mut engine = PdEngine::new();
        assert!(engine.next_deadline().is_none());

        let mut sub = test_subscriber(sock, 1000);
        sub.deadline = TimeVal::new(8, 0);
        engine.add_subscriber(sub);
        engine.add_publisher(Publisher {
            com_id: 1001,
            dest: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 59996),
            interval: TimeVal::from_millis(100),
            flags: Flags::empty(),
            red_id: 0,
            seq: 0,
            next_at: TimeVal::new(3, 0),
            payload: Vec::new(),
            sock,
            num_sent: 0,
        });
        assert_eq!(engine.next_deadline(), Some(TimeVal::new(3, 0)));
    }
}
