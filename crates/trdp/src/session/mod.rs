// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Application session
//!
//! The per-host engine instance: configuration defaults, marshalling
//! registry, socket pool, the PD and MD engines, redundancy groups,
//! topography counters and statistics, all behind one handle.
//!
//! ## Threading
//!
//! The protocol engine is single-threaded cooperative: all state mutation
//! happens inside [`Session::process`], on whichever thread calls it. API
//! calls from other threads serialize on the session mutex. Redundancy
//! state is an atomic snapshot so the send loop reads it without taking
//! a lock. User callbacks run after the session lock is released; they
//! must not re-enter `process`.

/// Configuration defaults consumed at open time.
pub mod config;
/// Reference-counted socket pool.
pub mod sockets;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use crate::api::{
    Error, Flags, ListenerHandle, MdCallback, PdCallback, PubHandle, Redundancy, ReplyStatus,
    Result, SendParam, SubHandle, TimeoutBehaviour, TrdpEvent,
};
use crate::engine::{Delivery, EventLoop};
use crate::marshal::MarshalConfig;
use crate::md::{Listener, MdEngine, MdTransport, TOKEN_TCP_CONN_BASE, TOKEN_TCP_LISTENER};
use crate::pd::{PdEngine, Publisher, Subscriber};
use crate::protocol::constants::MAX_PD_DATA_SIZE;
use crate::stats::{
    JoinStatistics, PublisherStatistics, RedStatistics, Statistics, SubscriberStatistics,
};
use crate::vos::mem::{MemBlock, MemPool};
use crate::vos::sock;
use crate::vos::time::{self, TimeVal};
use crate::vos::uuid::Uuid;

use config::SessionConfig;
use sockets::{SockKey, SockKind, SocketPool, TOKEN_TCP_BASE};

/// Receive staging buffer size (one max UDP datagram).
const RECV_BUF_SIZE: usize = 65536;

struct Core {
    ev: EventLoop,
    sockets: SocketPool,
    pd: PdEngine,
    md: MdEngine,
    stats: Statistics,
    topo: (u32, u32),
    recv_buf: MemBlock,
    closed: bool,
}

#[derive(Default)]
struct Callbacks {
    pd: Option<PdCallback>,
    md: Option<MdCallback>,
}

struct Shared {
    cfg: SessionConfig,
    own_ip: Ipv4Addr,
    marshal: MarshalConfig,
    mem: MemPool,
    red: ArcSwap<HashMap<u32, Redundancy>>,
    core: Mutex<Core>,
    callbacks: Mutex<Callbacks>,
}

/// Handle to one application session.
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open a session with the given configuration.
    pub fn open(cfg: SessionConfig) -> Result<Session> {
        let own_ip = if cfg.own_ip.is_unspecified() {
            sock::primary_ip()
        } else {
            cfg.own_ip
        };
        let mem = MemPool::new(&cfg.mem)?;
        let recv_buf = mem.alloc(RECV_BUF_SIZE)?;
        let ev = EventLoop::new()?;
        let md = MdEngine::new(cfg.md.max_sessions);

        log::info!(
            "[SESSION] open host='{}' ownIp={} pdPort={} mdPort={}",
            cfg.process.host_name,
            own_ip,
            cfg.pd.port,
            cfg.md.udp_port
        );

        Ok(Session {
            shared: Arc::new(Shared {
                own_ip,
                marshal: MarshalConfig::new(),
                mem,
                red: ArcSwap::from_pointee(HashMap::new()),
                core: Mutex::new(Core {
                    ev,
                    sockets: SocketPool::new(),
                    pd: PdEngine::new(),
                    md,
                    stats: Statistics::default(),
                    topo: (0, 0),
                    recv_buf,
                    closed: false,
                }),
                callbacks: Mutex::new(Callbacks::default()),
                cfg,
            }),
        })
    }

    /// Release every owned resource. Further calls fail with `NoInit`.
    pub fn close(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        if core.closed {
            return Err(Error::NoInit);
        }
        core.closed = true;
        core.sockets = SocketPool::new();
        core.pd = PdEngine::new();
        core.md = MdEngine::new(self.shared.cfg.md.max_sessions);
        log::info!("[SESSION] closed");
        Ok(())
    }

    /// Own interface address the session resolved at open.
    pub fn own_ip(&self) -> Ipv4Addr {
        self.shared.own_ip
    }

    /// Dataset registry for the configuration collaborator.
    pub fn marshal_config(&self) -> &MarshalConfig {
        &self.shared.marshal
    }

    /// Install the expected topography counters; frames carrying other
    /// non-zero generations are rejected from now on.
    pub fn set_topo_counts(&self, etb: u32, op_trn: u32) -> Result<()> {
        let mut core = self.lock_open()?;
        core.topo = (etb, op_trn);
        Ok(())
    }

    /// Register the PD delivery callback (push model).
    pub fn set_pd_callback(&self, cb: PdCallback) {
        self.shared.callbacks.lock().pd = Some(cb);
    }

    /// Register the MD delivery callback (push model).
    pub fn set_md_callback(&self, cb: MdCallback) {
        self.shared.callbacks.lock().md = Some(cb);
    }

    fn lock_open(&self) -> Result<parking_lot::MutexGuard<'_, Core>> {
        let core = self.shared.core.lock();
        if core.closed {
            return Err(Error::NoInit);
        }
        Ok(core)
    }

    fn wire_payload(&self, com_id: u32, flags: Flags, payload: &[u8]) -> Result<Vec<u8>> {
        if flags.contains(Flags::MARSHALL) && self.shared.marshal.has_com_id(com_id) {
            self.shared.marshal.marshal(com_id, payload)
        } else {
            Ok(payload.to_vec())
        }
    }

    // ========================================================================
    // PD API
    // ========================================================================

    /// Register a publisher; the first transmission happens one interval
    /// from now. `interval_us = 0` registers a pull-only publisher.
    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        &self,
        com_id: u32,
        src_ip: Ipv4Addr,
        dest_ip: Ipv4Addr,
        interval_us: u32,
        red_id: u32,
        flags: Flags,
        payload: &[u8],
    ) -> Result<PubHandle> {
        self.publish_with_param(
            com_id,
            src_ip,
            dest_ip,
            interval_us,
            red_id,
            flags,
            payload,
            SendParam::default(),
        )
    }

    /// [`Session::publish`] with per-telegram network overrides; QoS and
    /// TTL select (or open) the matching socket in the pool.
    #[allow(clippy::too_many_arguments)]
    pub fn publish_with_param(
        &self,
        com_id: u32,
        src_ip: Ipv4Addr,
        dest_ip: Ipv4Addr,
        interval_us: u32,
        red_id: u32,
        flags: Flags,
        payload: &[u8],
        param: SendParam,
    ) -> Result<PubHandle> {
        if com_id == 0 {
            return Err(Error::Param("comId 0 is reserved".into()));
        }
        if dest_ip.is_unspecified() {
            return Err(Error::Param("destination address required".into()));
        }
        let wire = self.wire_payload(com_id, flags, payload)?;
        if wire.len() > MAX_PD_DATA_SIZE {
            return Err(Error::Param("PD payload too large".into()));
        }

        let cfg = &self.shared.cfg.pd;
        let bind = if src_ip.is_unspecified() {
            self.shared.own_ip
        } else {
            src_ip
        };
        let mut core = self.lock_open()?;
        let key = SockKey {
            bind,
            port: 0,
            qos: param.qos.unwrap_or(cfg.qos),
            ttl: param.ttl.unwrap_or(cfg.ttl),
            kind: SockKind::PdSend,
        };
        let sock_idx = {
            let Core { sockets, ev, .. } = &mut *core;
            sockets.obtain(key, ev.registry())?
        };
        if dest_ip.is_multicast() {
            // Pin the egress interface for the group
            if let Err(e) = sock::set_multicast_if(core.sockets.get(sock_idx)?.socket(), bind) {
                log::warn!("[PD] set_multicast_if {}: {}", bind, e);
            }
        }

        let interval = TimeVal::from_micros(u64::from(interval_us));
        let now = time::now();
        let handle = core.pd.add_publisher(Publisher {
            com_id,
            dest: SocketAddrV4::new(dest_ip, cfg.port),
            interval,
            flags,
            red_id,
            seq: 0,
            next_at: if interval.is_zero() {
                TimeVal::ZERO
            } else {
                now + interval
            },
            payload: wire,
            sock: sock_idx,
            num_sent: 0,
        });
        log::debug!(
            "[PD] publish comId {} -> {} every {} us (handle {:?})",
            com_id,
            dest_ip,
            interval_us,
            handle
        );
        Ok(handle)
    }

    /// Remove a publisher and release its socket.
    pub fn unpublish(&self, handle: PubHandle) -> Result<()> {
        let mut core = self.lock_open()?;
        let publisher = core.pd.remove_publisher(handle)?;
        let Core { sockets, ev, .. } = &mut *core;
        sockets.release(publisher.sock, ev.registry());
        Ok(())
    }

    /// Replace a publisher's payload. With [`Flags::PUSH_ON_CHANGE`] the
    /// send deadline resets so the new value goes out immediately;
    /// otherwise the cycle cadence is untouched.
    pub fn put(&self, handle: PubHandle, payload: &[u8]) -> Result<()> {
        let mut core = self.lock_open()?;
        let com_id = core.pd.publisher_mut(handle)?.com_id;
        let flags = core.pd.publisher_mut(handle)?.flags;
        drop(core);

        let wire = self.wire_payload(com_id, flags, payload)?;
        if wire.len() > MAX_PD_DATA_SIZE {
            return Err(Error::Param("PD payload too large".into()));
        }

        let mut core = self.lock_open()?;
        let publisher = core.pd.publisher_mut(handle)?;
        publisher.payload = wire;
        if publisher.flags.contains(Flags::PUSH_ON_CHANGE) && !publisher.interval.is_zero() {
            publisher.next_at = time::now();
        }
        Ok(())
    }

    /// Register a subscriber. Multicast destinations are joined on the
    /// session's interface.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        &self,
        com_id: u32,
        src_ip1: Ipv4Addr,
        src_ip2: Ipv4Addr,
        dest_ip: Ipv4Addr,
        timeout_us: u32,
        behaviour: TimeoutBehaviour,
        flags: Flags,
    ) -> Result<SubHandle> {
        if com_id == 0 {
            return Err(Error::Param("comId 0 is reserved".into()));
        }
        let cfg = &self.shared.cfg.pd;
        let timeout_us = if timeout_us == 0 { cfg.timeout_us } else { timeout_us };
        let mut core = self.lock_open()?;

        let (bind, join) = if dest_ip.is_multicast() {
            (dest_ip, Some(dest_ip))
        } else {
            (Ipv4Addr::UNSPECIFIED, None)
        };
        let key = SockKey {
            bind,
            port: cfg.port,
            qos: cfg.qos,
            ttl: cfg.ttl,
            kind: SockKind::PdReceive,
        };
        let own_ip = self.shared.own_ip;
        let sock_idx = {
            let Core { sockets, ev, .. } = &mut *core;
            let idx = sockets.obtain(key, ev.registry())?;
            if let Some(group) = join {
                if let Err(e) = sockets.join(idx, group, own_ip) {
                    sockets.release(idx, ev.registry());
                    return Err(e);
                }
            }
            idx
        };

        let timeout = TimeVal::from_micros(u64::from(timeout_us));
        let now = time::now();
        let handle = core.pd.add_subscriber(Subscriber {
            com_id,
            src1: src_ip1,
            src2: src_ip2,
            dest: if dest_ip.is_unspecified() { own_ip } else { dest_ip },
            timeout,
            behaviour,
            flags,
            sock: sock_idx,
            deadline: if timeout.is_zero() { TimeVal::ZERO } else { now + timeout },
            timed_out: false,
            one_shot: false,
            last_seq: HashMap::new(),
            last_payload: Vec::new(),
            last_info: None,
            num_received: 0,
            num_timeouts: 0,
        });
        log::debug!("[PD] subscribe comId {} dest {} (handle {:?})", com_id, dest_ip, handle);
        Ok(handle)
    }

    /// Remove a subscriber and release its socket.
    pub fn unsubscribe(&self, handle: SubHandle) -> Result<()> {
        let mut core = self.lock_open()?;
        let subscriber = core.pd.remove_subscriber(handle)?;
        let Core { sockets, ev, .. } = &mut *core;
        sockets.release(subscriber.sock, ev.registry());
        Ok(())
    }

    /// PD pull: request a one-shot `Pp` reply from the publisher of
    /// `com_id` at `dest_ip`. The reply (or its absence) is supervised on
    /// the given subscriber with `reply_timeout_us`.
    pub fn pd_request(
        &self,
        subscriber: SubHandle,
        com_id: u32,
        dest_ip: Ipv4Addr,
        reply_com_id: u32,
        reply_timeout_us: u32,
    ) -> Result<()> {
        if reply_timeout_us == 0 {
            return Err(Error::Param("reply timeout required".into()));
        }
        let cfg = &self.shared.cfg.pd;
        let mut core = self.lock_open()?;
        let now = time::now();
        let topo = core.topo;
        let own_ip = self.shared.own_ip;
        let Core { pd, sockets, stats, .. } = &mut *core;
        pd.pull_request(
            subscriber,
            com_id,
            reply_com_id,
            SocketAddrV4::new(dest_ip, cfg.port),
            TimeVal::from_micros(u64::from(reply_timeout_us)),
            own_ip,
            now,
            topo,
            sockets,
            &mut stats.pd,
        )
    }

    // ========================================================================
    // Redundancy
    // ========================================================================

    /// Set a redundancy group to follower (suppressed) or leader.
    pub fn set_redundant(&self, group_id: u32, follower: bool) -> Result<()> {
        if group_id == 0 {
            return Err(Error::Param("redundancy group 0 is reserved".into()));
        }
        let state = if follower {
            Redundancy::Follower
        } else {
            Redundancy::Leader
        };
        let mut map: HashMap<u32, Redundancy> = (**self.shared.red.load()).clone();
        map.insert(group_id, state);
        self.shared.red.store(Arc::new(map));
        log::info!("[SESSION] redundancy group {} -> {:?}", group_id, state);
        Ok(())
    }

    /// Current arbitration state of a group (unknown groups lead).
    pub fn get_redundant(&self, group_id: u32) -> Redundancy {
        self.shared
            .red
            .load()
            .get(&group_id)
            .copied()
            .unwrap_or(Redundancy::Leader)
    }

    // ========================================================================
    // MD API
    // ========================================================================

    /// Open the MD UDP socket on demand. Listeners need the well-known
    /// port; a pure requester rides an ephemeral port (UDP replies come
    /// back to the request's source port). The first listener upgrades
    /// the binding; transactions in flight keep draining the old socket.
    fn ensure_md_udp(&self, core: &mut Core, well_known: bool) -> Result<()> {
        if core.md.udp_sock.is_some() && (!well_known || core.md.udp_well_known) {
            return Ok(());
        }
        let cfg = &self.shared.cfg.md;
        let key = SockKey {
            bind: Ipv4Addr::UNSPECIFIED,
            port: if well_known { cfg.udp_port } else { 0 },
            qos: cfg.qos,
            ttl: cfg.ttl,
            kind: SockKind::MdUdp,
        };
        let Core { sockets, ev, md, .. } = &mut *core;
        md.udp_sock = Some(sockets.obtain(key, ev.registry())?);
        md.udp_well_known = well_known;
        Ok(())
    }

    fn md_dest(&self, dest_ip: Ipv4Addr, flags: Flags) -> SocketAddrV4 {
        let cfg = &self.shared.cfg.md;
        let port = if flags.contains(Flags::TCP) {
            cfg.tcp_port
        } else {
            cfg.udp_port
        };
        SocketAddrV4::new(dest_ip, port)
    }

    /// Fire-and-forget notification (`Mn`).
    pub fn notify(
        &self,
        com_id: u32,
        dest_ip: Ipv4Addr,
        src_uri: &str,
        dest_uri: &str,
        payload: &[u8],
        flags: Flags,
    ) -> Result<()> {
        let wire = self.wire_payload(com_id, flags, payload)?;
        let dest = self.md_dest(dest_ip, flags);
        let mut core = self.lock_open()?;
        self.ensure_md_udp(&mut core, false)?;
        let topo = core.topo;
        let Core { md, sockets, ev, stats, .. } = &mut *core;
        let st = if flags.contains(Flags::TCP) {
            &mut stats.tcp_md
        } else {
            &mut stats.udp_md
        };
        md.notify(
            com_id,
            dest,
            &wire,
            (src_uri.to_owned(), dest_uri.to_owned()),
            flags,
            topo,
            sockets,
            ev.registry(),
            st,
        )
    }

    /// Open a request/reply transaction (`Mr`); returns its UUID.
    #[allow(clippy::too_many_arguments)]
    pub fn md_request(
        &self,
        com_id: u32,
        dest_ip: Ipv4Addr,
        src_uri: &str,
        dest_uri: &str,
        payload: &[u8],
        reply_timeout_us: u32,
        expected_replies: u32,
        flags: Flags,
        param: SendParam,
    ) -> Result<Uuid> {
        let cfg = &self.shared.cfg.md;
        let wire = self.wire_payload(com_id, flags, payload)?;
        let dest = self.md_dest(dest_ip, flags);
        let timeout_us = if reply_timeout_us == 0 {
            cfg.reply_timeout_us
        } else {
            reply_timeout_us
        };
        let retries = param.retries.unwrap_or(cfg.retries);

        let mut core = self.lock_open()?;
        self.ensure_md_udp(&mut core, false)?;
        let now = time::now();
        let topo = core.topo;
        let Core { md, sockets, ev, stats, .. } = &mut *core;
        let st = if flags.contains(Flags::TCP) {
            &mut stats.tcp_md
        } else {
            &mut stats.udp_md
        };
        md.request(
            com_id,
            dest,
            &wire,
            (src_uri.to_owned(), dest_uri.to_owned()),
            TimeVal::from_micros(u64::from(timeout_us)),
            expected_replies,
            retries,
            flags,
            now,
            topo,
            sockets,
            ev.registry(),
            st,
        )
    }

    /// Final reply without confirmation (`Mp`).
    pub fn md_reply(
        &self,
        session_id: Uuid,
        payload: &[u8],
        status: ReplyStatus,
        src_uri: &str,
    ) -> Result<()> {
        let core = self.lock_open()?;
        let (com_id, flags) = core.md.session_com_id(session_id).ok_or(Error::NoSession)?;
        drop(core);
        let wire = self.wire_payload(com_id, flags, payload)?;

        let mut core = self.lock_open()?;
        let topo = core.topo;
        let Core { md, sockets, stats, .. } = &mut *core;
        let st = if flags.contains(Flags::TCP) {
            &mut stats.tcp_md
        } else {
            &mut stats.udp_md
        };
        md.reply(
            session_id,
            &wire,
            status,
            (src_uri.to_owned(), String::new()),
            topo,
            sockets,
            st,
        )
    }

    /// Reply expecting confirmation (`Mq`).
    pub fn md_reply_query(
        &self,
        session_id: Uuid,
        payload: &[u8],
        status: ReplyStatus,
        src_uri: &str,
        confirm_timeout_us: u32,
    ) -> Result<()> {
        let cfg = &self.shared.cfg.md;
        let confirm_us = if confirm_timeout_us == 0 {
            cfg.confirm_timeout_us
        } else {
            confirm_timeout_us
        };
        let core = self.lock_open()?;
        let (com_id, flags) = core.md.session_com_id(session_id).ok_or(Error::NoSession)?;
        drop(core);
        let wire = self.wire_payload(com_id, flags, payload)?;

        let mut core = self.lock_open()?;
        let now = time::now();
        let topo = core.topo;
        let Core { md, sockets, stats, .. } = &mut *core;
        let st = if flags.contains(Flags::TCP) {
            &mut stats.tcp_md
        } else {
            &mut stats.udp_md
        };
        md.reply_query(
            session_id,
            &wire,
            status,
            (src_uri.to_owned(), String::new()),
            TimeVal::from_micros(u64::from(confirm_us)),
            now,
            topo,
            sockets,
            st,
        )
    }

    /// Confirm a received `Mq` reply (`Mc`).
    pub fn md_confirm(&self, session_id: Uuid, status: ReplyStatus) -> Result<()> {
        let mut core = self.lock_open()?;
        let (_, flags) = core.md.session_com_id(session_id).ok_or(Error::NoSession)?;
        let topo = core.topo;
        let Core { md, sockets, stats, .. } = &mut *core;
        let st = if flags.contains(Flags::TCP) {
            &mut stats.tcp_md
        } else {
            &mut stats.udp_md
        };
        md.confirm(session_id, status, topo, sockets, st)
    }

    /// Register a listener for incoming requests on `com_id`.
    pub fn add_listener(&self, com_id: u32, uri: &str, flags: Flags) -> Result<ListenerHandle> {
        let mut core = self.lock_open()?;
        self.ensure_md_udp(&mut core, true)?;
        if flags.contains(Flags::TCP) {
            let port = self.shared.cfg.md.tcp_port;
            let Core { md, ev, .. } = &mut *core;
            md.tcp.ensure_listener(Ipv4Addr::UNSPECIFIED, port, ev.registry())?;
        }
        Ok(core.md.add_listener(Listener {
            com_id,
            uri: uri.to_owned(),
            flags,
        }))
    }

    /// Remove a listener registration.
    pub fn del_listener(&self, handle: ListenerHandle) -> Result<()> {
        self.lock_open()?.md.del_listener(handle)
    }

    /// Abort a transaction; pending callbacks for it are dropped.
    pub fn abort_session(&self, session_id: Uuid) -> Result<()> {
        self.lock_open()?.md.abort(session_id)
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Time until the earliest pending deadline (send cycle, subscription
    /// timeout or MD deadline), capped by nothing; with no deadline at all
    /// the configured cycle time is returned.
    pub fn get_interval(&self) -> Result<Duration> {
        let core = self.lock_open()?;
        let now = time::now();
        Ok(Self::interval_of(&core, now, self.shared.cfg.process.cycle_us))
    }

    fn interval_of(core: &Core, now: TimeVal, cycle_us: u32) -> Duration {
        let next = [core.pd.next_deadline(), core.md.next_deadline()]
            .into_iter()
            .flatten()
            .min();
        match next {
            Some(at) => at.saturating_sub(now).as_duration(),
            None => Duration::from_micros(u64::from(cycle_us)),
        }
    }

    /// One engine tick: drain ready sockets, run the PD scheduler, fire
    /// expired deadlines. Returns the deliveries that are not consumed by
    /// registered callbacks.
    ///
    /// In blocking mode the tick waits inside for readiness up to the
    /// computed interval; otherwise it polls and returns immediately.
    pub fn process(&self) -> Result<Vec<TrdpEvent>> {
        let mut deliveries = Vec::new();
        {
            let mut core = self.lock_open()?;
            let now = time::now();
            let timeout = if self.shared.cfg.process.blocking {
                Some(Self::interval_of(&core, now, self.shared.cfg.process.cycle_us))
            } else {
                Some(Duration::ZERO)
            };

            let ready = core.ev.poll(timeout)?;
            for r in ready {
                if r.token < TOKEN_TCP_BASE {
                    self.drain_udp(&mut core, r.token, &mut deliveries);
                } else if r.token == TOKEN_TCP_LISTENER {
                    let Core { md, ev, .. } = &mut *core;
                    md.tcp.accept_ready(ev.registry());
                } else {
                    self.service_tcp_conn(
                        &mut core,
                        r.token - TOKEN_TCP_CONN_BASE,
                        r.readable,
                        r.writable,
                        &mut deliveries,
                    );
                }
            }

            let now = time::now();
            let topo = core.topo;
            let red = self.shared.red.load_full();
            let Core { pd, md, sockets, stats, .. } = &mut *core;
            pd.tick_send(now, topo, &red, sockets, &mut stats.pd);
            pd.tick_timeouts(now, &mut stats.pd, &mut deliveries);
            let Statistics { udp_md, tcp_md, .. } = stats;
            md.tick(now, sockets, udp_md, tcp_md, &mut deliveries);
        }

        // Dispatch callbacks outside the session lock
        let mut events = Vec::new();
        let mut callbacks = self.shared.callbacks.lock();
        for Delivery { event, callback } in deliveries {
            if callback {
                match &event {
                    TrdpEvent::Pd {
                        info,
                        payload,
                        result,
                        ..
                    } => {
                        if let Some(cb) = callbacks.pd.as_mut() {
                            cb(info, payload, *result);
                            continue;
                        }
                    }
                    TrdpEvent::Md {
                        info,
                        payload,
                        result,
                        ..
                    } => {
                        if let Some(cb) = callbacks.md.as_mut() {
                            cb(info, payload, *result);
                            continue;
                        }
                    }
                }
            }
            events.push(event);
        }
        Ok(events)
    }

    fn drain_udp(&self, core: &mut Core, token: usize, out: &mut Vec<Delivery>) {
        let pd_port = self.shared.cfg.pd.port;
        let confirm = TimeVal::from_micros(u64::from(self.shared.cfg.md.confirm_timeout_us));
        loop {
            let now = time::now();
            let topo = core.topo;
            let Core {
                sockets,
                pd,
                md,
                stats,
                recv_buf,
                ..
            } = &mut *core;
            let Ok(entry) = sockets.get(token) else { return };
            let kind = entry.kind();
            let (n, src_ip, src_port) = match sock::receive_udp(entry.socket(), recv_buf) {
                Ok(r) => r,
                Err(Error::NoData) => return,
                Err(e) => {
                    log::warn!("[SESSION] receive on socket {}: {}", token, e);
                    return;
                }
            };
            let buf = &recv_buf[..n];
            match kind {
                SockKind::PdReceive | SockKind::PdSend => {
                    pd.handle_datagram(
                        token,
                        src_ip,
                        buf,
                        now,
                        topo,
                        pd_port,
                        &self.shared.marshal,
                        sockets,
                        &mut stats.pd,
                        out,
                    );
                }
                SockKind::MdUdp => {
                    md.handle_frame(
                        MdTransport::Udp,
                        SocketAddrV4::new(src_ip, src_port),
                        buf,
                        now,
                        topo,
                        confirm,
                        &self.shared.marshal,
                        &mut stats.udp_md,
                        out,
                    );
                }
            }
        }
    }

    fn service_tcp_conn(
        &self,
        core: &mut Core,
        conn: usize,
        readable: bool,
        writable: bool,
        out: &mut Vec<Delivery>,
    ) {
        let confirm = TimeVal::from_micros(u64::from(self.shared.cfg.md.confirm_timeout_us));
        let now = time::now();
        let topo = core.topo;
        let Core { md, ev, stats, .. } = &mut *core;

        if writable {
            if let Err(e) = md.tcp.handle_writable(conn) {
                log::warn!("[MD] conn {} write: {}", conn, e);
                md.tcp.close(conn, ev.registry());
                md.abort_connection(conn, out);
                return;
            }
        }
        if readable {
            match md.tcp.handle_readable(conn) {
                Ok((frames, closed)) => {
                    let peer = md
                        .tcp
                        .peer(conn)
                        .unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
                    for frame in frames {
                        md.handle_frame(
                            MdTransport::Tcp(conn),
                            peer,
                            &frame,
                            now,
                            topo,
                            confirm,
                            &self.shared.marshal,
                            &mut stats.tcp_md,
                            out,
                        );
                    }
                    if closed {
                        md.tcp.close(conn, ev.registry());
                        md.abort_connection(conn, out);
                    }
                }
                Err(e) => {
                    log::warn!("[MD] conn {} read: {}", conn, e);
                    md.tcp.close(conn, ev.registry());
                    md.abort_connection(conn, out);
                }
            }
        }
    }

    /// Spawn an engine thread cycling on `process` until the session is
    /// closed. Deliveries reach the registered callbacks; events nobody
    /// listens for are dropped. The sleep between ticks is the computed
    /// interval, capped at the configured cycle time so API calls from
    /// other threads are picked up promptly.
    pub fn start(&self) -> std::thread::JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || {
            let session = Session { shared };
            let cycle = Duration::from_micros(u64::from(session.shared.cfg.process.cycle_us));
            loop {
                match session.process() {
                    Ok(_) => {}
                    Err(Error::NoInit) => break,
                    Err(e) => log::warn!("[SESSION] engine thread: {}", e),
                }
                match session.get_interval() {
                    Ok(interval) => std::thread::sleep(interval.min(cycle)),
                    Err(_) => break,
                }
            }
        })
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Full counter snapshot.
    pub fn get_statistics(&self) -> Result<Statistics> {
        let core = self.lock_open()?;
        let mut stats = core.stats.clone();
        stats.mem = self.shared.mem.statistics();
        Ok(stats)
    }

    /// Zero the protocol counters.
    pub fn reset_statistics(&self) -> Result<()> {
        self.lock_open()?.stats.reset();
        Ok(())
    }

    /// Per-subscriber snapshots.
    pub fn get_subs_statistics(&self) -> Result<Vec<SubscriberStatistics>> {
        Ok(self.lock_open()?.pd.subscriber_statistics())
    }

    /// Per-publisher snapshots.
    pub fn get_pub_statistics(&self) -> Result<Vec<PublisherStatistics>> {
        Ok(self.lock_open()?.pd.publisher_statistics())
    }

    /// Redundancy group states.
    pub fn get_red_statistics(&self) -> Result<Vec<RedStatistics>> {
        let red = self.shared.red.load();
        let mut groups: Vec<RedStatistics> = red
            .iter()
            .map(|(&group_id, &state)| RedStatistics { group_id, state })
            .collect();
        groups.sort_by_key(|g| g.group_id);
        Ok(groups)
    }

    /// Multicast membership snapshot.
    pub fn get_join_statistics(&self) -> Result<JoinStatistics> {
        Ok(JoinStatistics {
            groups: self.lock_open()?.sockets.joined_groups(),
        })
    }

    /// MD-over-UDP counters only.
    pub fn get_udp_md_statistics(&self) -> Result<crate::stats::MdStatistics> {
        Ok(self.lock_open()?.stats.udp_md)
    }

    /// MD-over-TCP counters only.
    pub fn get_tcp_md_statistics(&self) -> Result<crate::stats::MdStatistics> {
        Ok(self.lock_open()?.stats.tcp_md)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_session() -> Session {
        let mut cfg = SessionConfig {
            own_ip: Ipv4Addr::LOCALHOST,
            ..SessionConfig::default()
        };
        // Ephemeral ports so parallel tests never collide
        cfg.pd.port = 0;
        cfg.md.udp_port = 0;
        Session::open(cfg).expect("session")
    }

    #[test]
    fn open_close_lifecycle() {
        let session = open_test_session();
        assert_eq!(session.own_ip(), Ipv4Addr::LOCALHOST);
        session.close().expect("close");
        assert!(matches!(session.close(), Err(Error::NoInit)));
        assert!(matches!(session.process(), Err(Error::NoInit)));
    }

    #[test]
    fn publish_rejects_bad_parameters() {
        let session = open_test_session();
        assert!(matches!(
            session.publish(0, Ipv4Addr::UNSPECIFIED, Ipv4Addr::LOCALHOST, 1000, 0, Flags::empty(), &[]),
            Err(Error::Param(_))
        ));
        assert!(matches!(
            session.publish(1000, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, 1000, 0, Flags::empty(), &[]),
            Err(Error::Param(_))
        ));
        let big = vec![0u8; MAX_PD_DATA_SIZE + 1];
        assert!(matches!(
            session.publish(1000, Ipv4Addr::UNSPECIFIED, Ipv4Addr::LOCALHOST, 1000, 0, Flags::empty(), &big),
            Err(Error::Param(_))
        ));
    }

    #[test]
    fn publisher_and_subscriber_lifecycle() {
        let session = open_test_session();
        let p = session
            .publish(1000, Ipv4Addr::UNSPECIFIED, Ipv4Addr::LOCALHOST, 100_000, 0, Flags::empty(), &[1, 2, 3, 4])
            .expect("publish");
        let s = session
            .subscribe(1000, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, 200_000, TimeoutBehaviour::Zero, Flags::empty())
            .expect("subscribe");

        assert_eq!(session.get_pub_statistics().expect("stats").len(), 1);
        assert_eq!(session.get_subs_statistics().expect("stats").len(), 1);

        session.unpublish(p).expect("unpublish");
        session.unsubscribe(s).expect("unsubscribe");
        assert!(matches!(session.unpublish(p), Err(Error::NoPublisher)));
        assert!(matches!(session.unsubscribe(s), Err(Error::NoSubscriber)));
    }

    #[test]
    fn put_updates_payload_and_push_on_change_resets_deadline() {
        let session = open_test_session();
        let p = session
            .publish(
                1000,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::LOCALHOST,
                1_000_000,
                0,
                Flags::PUSH_ON_CHANGE,
                &[0, 0, 0, 0],
            )
            .expect("publish");

        {
            let core = session.shared.core.lock();
            let next = core
                .pd
                .publishers_next_at_for_test(p)
                .expect("publisher");
            assert!(!next.is_zero());
        }
        session.put(p, &[9, 9, 9, 9]).expect("put");
        let core = session.shared.core.lock();
        let next = core.pd.publishers_next_at_for_test(p).expect("publisher");
        // Deadline pulled in to "now": it must be due within one cycle
        assert!(next <= time::now());
    }

    #[test]
    fn redundancy_snapshot_round_trip() {
        let session = open_test_session();
        assert_eq!(session.get_redundant(5), Redundancy::Leader);
        session.set_redundant(5, true).expect("set");
        assert_eq!(session.get_redundant(5), Redundancy::Follower);
        session.set_redundant(5, false).expect("set");
        assert_eq!(session.get_redundant(5), Redundancy::Leader);
        assert!(matches!(session.set_redundant(0, true), Err(Error::Param(_))));

        session.set_redundant(7, true).expect("set");
        let red = session.get_red_statistics().expect("stats");
        assert_eq!(red.len(), 2);
    }

    #[test]
    fn get_interval_defaults_to_cycle_time() {
        let session = open_test_session();
        let interval = session.get_interval().expect("interval");
        assert_eq!(interval, Duration::from_micros(10_000));

        session
            .publish(1000, Ipv4Addr::UNSPECIFIED, Ipv4Addr::LOCALHOST, 50_000, 0, Flags::empty(), &[1, 2, 3, 4])
            .expect("publish");
        let interval = session.get_interval().expect("interval");
        assert!(interval <= Duration::from_micros(50_000));
    }

    #[test]
    fn process_on_idle_session_returns_no_events() {
        let session = open_test_session();
        let events = session.process().expect("process");
        assert!(events.is_empty());
    }

    #[test]
    fn engine_thread_exits_on_close() {
        let session = open_test_session();
        let handle = session.start();
        std::thread::sleep(Duration::from_millis(50));
        session.close().expect("close");
        handle.join().expect("engine thread must exit");
    }

    #[test]
    fn statistics_snapshot_carries_mem_counters() {
        let session = open_test_session();
        let stats = session.get_statistics().expect("stats");
        // Heap mode: the 64 KiB receive buffer is the one live allocation
        assert_eq!(stats.mem.total, 0);
        session.reset_statistics().expect("reset");
    }
}
