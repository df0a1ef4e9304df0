// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # MD engine
//!
//! Request/notify/reply/confirm transactions over UDP or TCP.
//!
//! Every transaction is one entry in the session table, keyed by its UUID
//! and driven by an explicit state machine; deadlines sit in a min-heap of
//! absolute times and are popped by the engine tick. No coroutines, no
//! hidden blocking.
//!
//! # State machine
//!
//! ```text
//! requester:  IDLE -> SENT_REQUEST -> RECEIVED_REPLY -> DONE   (Mq + confirm)
//!             IDLE -> SENT_REQUEST -> DONE                     (Mp)
//!             IDLE -> DONE                                     (Mn, fire-and-forget)
//! replier:    IDLE -> RECEIVED_REQUEST -> SENT_REPLY -> DONE   (Mq + Mc)
//!             IDLE -> RECEIVED_REQUEST -> DONE                 (Mp)
//! any state --fatal--> ABORTED
//! ```
//!
//! `DONE`/`ABORTED` are expressed by removing the entry; the delivery
//! event carries the terminal result.

pub(crate) mod tcp;

use mio::Registry;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::api::{
    Error, EventResult, Flags, ListenerHandle, MdInfo, ReplyStatus, Result, TrdpEvent,
};
use crate::engine::Delivery;
use crate::marshal::MarshalConfig;
use crate::protocol::constants::{MSG_MC, MSG_ME, MSG_MN, MSG_MP, MSG_MQ, MSG_MR};
use crate::protocol::md::MdHeader;
use crate::session::sockets::SocketPool;
use crate::stats::MdStatistics;
use crate::vos::sock;
use crate::vos::time::TimeVal;
use crate::vos::uuid::Uuid;

pub(crate) use tcp::{TcpTransport, TOKEN_TCP_CONN_BASE, TOKEN_TCP_LISTENER};

/// Which side of the transaction this host plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MdRole {
    Requester,
    Replier,
}

/// Transport binding of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MdTransport {
    Udp,
    /// TCP connection index.
    Tcp(usize),
}

/// Live (non-terminal) transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MdState {
    /// Requester: request on the wire, reply pending.
    SentRequest,
    /// Requester: `Mq` received, application must confirm.
    ReceivedReply,
    /// Replier: request dispatched, application must reply.
    ReceivedRequest,
    /// Replier: `Mq` on the wire, confirmation pending.
    SentReply,
}

/// One entry in the session table.
pub(crate) struct MdSession {
    pub id: Uuid,
    pub role: MdRole,
    pub transport: MdTransport,
    pub state: MdState,
    pub com_id: u32,
    pub peer: SocketAddrV4,
    /// Reply deadline (requester) or application reply deadline (replier).
    pub reply_deadline: TimeVal,
    /// Confirm deadline: wire confirm (replier) or application confirm
    /// (requester).
    pub confirm_deadline: TimeVal,
    pub retries_left: u8,
    pub expected_replies: u32,
    pub num_replies: u32,
    /// Request frame kept for retransmission.
    pub stored_frame: Vec<u8>,
    pub listener: Option<ListenerHandle>,
    pub flags: Flags,
    /// Rearm value for retransmissions.
    pub reply_timeout: TimeVal,
}

/// A replier's registration for incoming requests.
pub(crate) struct Listener {
    pub com_id: u32,
    /// Destination URI filter; empty matches any.
    pub uri: String,
    pub flags: Flags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DeadlineKind {
    Reply,
    Confirm,
}

/// Session table, listener table, transports and the deadline heap.
pub(crate) struct MdEngine {
    sessions: HashMap<Uuid, MdSession>,
    listeners: Vec<Option<Listener>>,
    /// Pool index of the MD UDP socket, once opened.
    pub udp_sock: Option<usize>,
    /// Whether `udp_sock` is bound to the well-known MD port (listeners
    /// need it; pure requesters ride an ephemeral port and replies come
    /// back to the request's source port).
    pub udp_well_known: bool,
    pub tcp: TcpTransport,
    /// Min-heap of (absolute time, kind, session). Entries are lazily
    /// invalidated: a popped entry only fires if it still matches the
    /// session's current deadline.
    deadlines: BinaryHeap<Reverse<(TimeVal, DeadlineKind, Uuid)>>,
    max_sessions: u32,
}

fn info_from_header(h: &MdHeader, src_ip: Ipv4Addr, num_replies: u32, expected: u32) -> MdInfo {
    MdInfo {
        com_id: h.com_id,
        msg_type: h.msg_type,
        session_id: h.session_id,
        src_ip,
        etb_topo_cnt: h.etb_topo_cnt,
        op_trn_topo_cnt: h.op_trn_topo_cnt,
        num_expected_replies: expected,
        num_replies,
        reply_status: ReplyStatus::from_i32(h.reply_status),
        src_uri: h.src_uri.clone(),
        dest_uri: h.dest_uri.clone(),
    }
}

fn terminal_info(session: &MdSession, result_status: ReplyStatus) -> MdInfo {
    MdInfo {
        com_id: session.com_id,
        msg_type: MSG_ME,
        session_id: session.id,
        src_ip: *session.peer.ip(),
        etb_topo_cnt: 0,
        op_trn_topo_cnt: 0,
        num_expected_replies: session.expected_replies,
        num_replies: session.num_replies,
        reply_status: result_status,
        src_uri: String::new(),
        dest_uri: String::new(),
    }
}

impl MdEngine {
    pub fn new(max_sessions: u32) -> Self {
        MdEngine {
            sessions: HashMap::new(),
            listeners: Vec::new(),
            udp_sock: None,
            udp_well_known: false,
            tcp: TcpTransport::new(),
            deadlines: BinaryHeap::new(),
            max_sessions,
        }
    }

    // ========================================================================
    // Listener table
    // ========================================================================

    pub fn add_listener(&mut self, listener: Listener) -> ListenerHandle {
        let idx = self
            .listeners
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.listeners.len());
        if idx == self.listeners.len() {
            self.listeners.push(Some(listener));
        } else {
            self.listeners[idx] = Some(listener);
        }
        ListenerHandle(idx as u32)
    }

    pub fn del_listener(&mut self, handle: ListenerHandle) -> Result<()> {
        self.listeners
            .get_mut(handle.0 as usize)
            .and_then(Option::take)
            .map(|_| ())
            .ok_or(Error::NoListener)
    }

    fn match_listener(&self, com_id: u32, dest_uri: &str) -> Option<ListenerHandle> {
        self.listeners.iter().enumerate().find_map(|(idx, slot)| {
            let l = slot.as_ref()?;
            if l.com_id == com_id && (l.uri.is_empty() || l.uri == dest_uri) {
                Some(ListenerHandle(idx as u32))
            } else {
                None
            }
        })
    }

    fn listener_flags(&self, handle: ListenerHandle) -> Flags {
        self.listeners
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .map_or(Flags::empty(), |l| l.flags)
    }

    // ========================================================================
    // Requester API
    // ========================================================================

    /// Fire-and-forget notification; no table entry survives the send.
    #[allow(clippy::too_many_arguments)]
    pub fn notify(
        &mut self,
        com_id: u32,
        dest: SocketAddrV4,
        payload: &[u8],
        uris: (String, String),
        flags: Flags,
        topo: (u32, u32),
        pool: &SocketPool,
        registry: &Registry,
        stats: &mut MdStatistics,
    ) -> Result<()> {
        let mut header = MdHeader::new(MSG_MN, com_id, Uuid::generate(), topo);
        header.src_uri = uris.0;
        header.dest_uri = uris.1;
        let frame = header.pack(payload)?;
        let transport = self.bind_transport(flags, dest, registry)?;
        self.send_frame(transport, dest, frame, pool)?;
        stats.sent += 1;
        Ok(())
    }

    /// Open a transaction and send `Mr`.
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        &mut self,
        com_id: u32,
        dest: SocketAddrV4,
        payload: &[u8],
        uris: (String, String),
        reply_timeout: TimeVal,
        expected_replies: u32,
        retries: u8,
        flags: Flags,
        now: TimeVal,
        topo: (u32, u32),
        pool: &SocketPool,
        registry: &Registry,
        stats: &mut MdStatistics,
    ) -> Result<Uuid> {
        if self.sessions.len() as u32 >= self.max_sessions {
            return Err(Error::State("MD session table full".into()));
        }
        let id = Uuid::generate();
        let mut header = MdHeader::new(MSG_MR, com_id, id, topo);
        header.src_uri = uris.0;
        header.dest_uri = uris.1;
        header.reply_timeout = reply_timeout.as_micros() as u32;
        let frame = header.pack(payload)?;

        let transport = self.bind_transport(flags, dest, registry)?;
        self.send_frame(transport, dest, frame.clone(), pool)?;
        stats.sent += 1;

        let deadline = now + reply_timeout;
        self.sessions.insert(
            id,
            MdSession {
                id,
                role: MdRole::Requester,
                transport,
                state: MdState::SentRequest,
                com_id,
                peer: dest,
                reply_deadline: deadline,
                confirm_deadline: TimeVal::ZERO,
                retries_left: retries,
                expected_replies: expected_replies.max(1),
                num_replies: 0,
                stored_frame: frame,
                listener: None,
                flags,
                reply_timeout,
            },
        );
        self.deadlines
            .push(Reverse((deadline, DeadlineKind::Reply, id)));
        log::debug!("[MD] request comId {} session {} -> {}", com_id, id, dest);
        Ok(id)
    }

    /// Requester confirms a `Mq` reply.
    pub fn confirm(
        &mut self,
        id: Uuid,
        status: ReplyStatus,
        topo: (u32, u32),
        pool: &SocketPool,
        stats: &mut MdStatistics,
    ) -> Result<()> {
        let session = self.sessions.get(&id).ok_or(Error::NoSession)?;
        if session.role != MdRole::Requester || session.state != MdState::ReceivedReply {
            return Err(Error::State("confirm outside RECEIVED_REPLY".into()));
        }
        let mut header = MdHeader::new(MSG_MC, session.com_id, id, topo);
        header.reply_status = status.as_i32();
        let frame = header.pack(&[])?;
        let (transport, peer) = (session.transport, session.peer);
        self.send_frame(transport, peer, frame, pool)?;
        stats.sent += 1;
        self.sessions.remove(&id);
        Ok(())
    }

    // ========================================================================
    // Replier API
    // ========================================================================

    /// Final reply (`Mp`); closes the transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn reply(
        &mut self,
        id: Uuid,
        payload: &[u8],
        status: ReplyStatus,
        uris: (String, String),
        topo: (u32, u32),
        pool: &SocketPool,
        stats: &mut MdStatistics,
    ) -> Result<()> {
        let session = self.replier_in_received_request(id)?;
        let mut header = MdHeader::new(MSG_MP, session.com_id, id, topo);
        header.reply_status = status.as_i32();
        header.src_uri = uris.0;
        header.dest_uri = uris.1;
        let frame = header.pack(payload)?;
        let (transport, peer) = (session.transport, session.peer);
        self.send_frame(transport, peer, frame, pool)?;
        stats.sent += 1;
        self.sessions.remove(&id);
        Ok(())
    }

    /// Reply expecting confirmation (`Mq`); arms the confirm timeout.
    #[allow(clippy::too_many_arguments)]
    pub fn reply_query(
        &mut self,
        id: Uuid,
        payload: &[u8],
        status: ReplyStatus,
        uris: (String, String),
        confirm_timeout: TimeVal,
        now: TimeVal,
        topo: (u32, u32),
        pool: &SocketPool,
        stats: &mut MdStatistics,
    ) -> Result<()> {
        let session = self.replier_in_received_request(id)?;
        let mut header = MdHeader::new(MSG_MQ, session.com_id, id, topo);
        header.reply_status = status.as_i32();
        header.src_uri = uris.0;
        header.dest_uri = uris.1;
        header.reply_timeout = confirm_timeout.as_micros() as u32;
        let frame = header.pack(payload)?;
        let (transport, peer) = (session.transport, session.peer);
        self.send_frame(transport, peer, frame, pool)?;
        stats.sent += 1;

        let deadline = now + confirm_timeout;
        if let Some(s) = self.sessions.get_mut(&id) {
            s.state = MdState::SentReply;
            s.reply_deadline = TimeVal::ZERO;
            s.confirm_deadline = deadline;
        }
        self.deadlines
            .push(Reverse((deadline, DeadlineKind::Confirm, id)));
        Ok(())
    }

    fn replier_in_received_request(&self, id: Uuid) -> Result<&MdSession> {
        let session = self.sessions.get(&id).ok_or(Error::NoSession)?;
        if session.role != MdRole::Replier || session.state != MdState::ReceivedRequest {
            return Err(Error::State("reply outside RECEIVED_REQUEST".into()));
        }
        Ok(session)
    }

    /// Drop a transaction by API.
    pub fn abort(&mut self, id: Uuid) -> Result<()> {
        self.sessions.remove(&id).map(|_| ()).ok_or(Error::NoSession)
    }

    // ========================================================================
    // Receive dispatch
    // ========================================================================

    /// Parse and dispatch one received MD frame.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_frame(
        &mut self,
        from: MdTransport,
        src: SocketAddrV4,
        buf: &[u8],
        now: TimeVal,
        topo: (u32, u32),
        app_confirm_timeout: TimeVal,
        marshal: &MarshalConfig,
        stats: &mut MdStatistics,
        out: &mut Vec<Delivery>,
    ) {
        let (header, body) = match MdHeader::parse(buf, topo) {
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
            MSG_MN => self.on_notify(&header, body, src, marshal, stats, out),
            MSG_MR => self.on_request(&header, body, src, from, now, marshal, stats, out),
            MSG_MP | MSG_MQ => {
                self.on_reply(&header, body, src, now, app_confirm_timeout, marshal, stats, out);
            }
            MSG_MC => self.on_confirm(&header, src, stats, out),
            MSG_ME => self.on_error(&header, src, stats, out),
            _ => stats.protocol_errors += 1,
        }
    }

    fn unmarshal_payload(
        flags: Flags,
        com_id: u32,
        body: &[u8],
        marshal: &MarshalConfig,
    ) -> Result<Vec<u8>> {
        if flags.contains(Flags::MARSHALL) && marshal.has_com_id(com_id) {
            marshal.unmarshal(com_id, body)
        } else {
            Ok(body.to_vec())
        }
    }

    fn on_notify(
        &mut self,
        header: &MdHeader,
        body: &[u8],
        src: SocketAddrV4,
        marshal: &MarshalConfig,
        stats: &mut MdStatistics,
        out: &mut Vec<Delivery>,
    ) {
        let Some(listener) = self.match_listener(header.com_id, &header.dest_uri) else {
            stats.no_listener += 1;
            log::debug!("[MD] Mn comId {} matched no listener", header.com_id);
            return;
        };
        let flags = self.listener_flags(listener);
        let payload = match Self::unmarshal_payload(flags, header.com_id, body, marshal) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("[MD] unmarshal comId {}: {}", header.com_id, e);
                stats.protocol_errors += 1;
                return;
            }
        };
        stats.received += 1;
        out.push(Delivery {
            event: TrdpEvent::Md {
                listener: Some(listener),
                info: info_from_header(header, *src.ip(), 0, 0),
                payload,
                result: EventResult::Ok,
            },
            callback: flags.contains(Flags::CALLBACK),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn on_request(
        &mut self,
        header: &MdHeader,
        body: &[u8],
        src: SocketAddrV4,
        from: MdTransport,
        now: TimeVal,
        marshal: &MarshalConfig,
        stats: &mut MdStatistics,
        out: &mut Vec<Delivery>,
    ) {
        if self.sessions.contains_key(&header.session_id) {
            log::debug!("[MD] duplicate Mr for session {}", header.session_id);
            return;
        }
        let Some(listener) = self.match_listener(header.com_id, &header.dest_uri) else {
            stats.no_listener += 1;
            log::debug!("[MD] Mr comId {} matched no listener", header.com_id);
            return;
        };
        let flags = self.listener_flags(listener);
        let payload = match Self::unmarshal_payload(flags, header.com_id, body, marshal) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("[MD] unmarshal comId {}: {}", header.com_id, e);
                stats.protocol_errors += 1;
                return;
            }
        };

        // Application reply window granted by the requester
        let reply_deadline = if header.reply_timeout > 0 {
            now + TimeVal::from_micros(u64::from(header.reply_timeout))
        } else {
            TimeVal::ZERO
        };
        self.sessions.insert(
            header.session_id,
            MdSession {
                id: header.session_id,
                role: MdRole::Replier,
                transport: from,
                state: MdState::ReceivedRequest,
                com_id: header.com_id,
                peer: src,
                reply_deadline,
                confirm_deadline: TimeVal::ZERO,
                retries_left: 0,
                expected_replies: 0,
                num_replies: 0,
                stored_frame: Vec::new(),
                listener: Some(listener),
                flags,
                reply_timeout: TimeVal::ZERO,
            },
        );
        if !reply_deadline.is_zero() {
            self.deadlines
                .push(Reverse((reply_deadline, DeadlineKind::Reply, header.session_id)));
        }
        stats.received += 1;
        out.push(Delivery {
            event: TrdpEvent::Md {
                listener: Some(listener),
                info: info_from_header(header, *src.ip(), 0, 0),
                payload,
                result: EventResult::Ok,
            },
            callback: flags.contains(Flags::CALLBACK),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn on_reply(
        &mut self,
        header: &MdHeader,
        body: &[u8],
        src: SocketAddrV4,
        now: TimeVal,
        app_confirm_timeout: TimeVal,
        marshal: &MarshalConfig,
        stats: &mut MdStatistics,
        out: &mut Vec<Delivery>,
    ) {
        let Some(session) = self.sessions.get_mut(&header.session_id) else {
            stats.no_listener += 1;
            log::debug!("[MD] reply for unknown session {}", header.session_id);
            return;
        };
        if session.role != MdRole::Requester || session.state != MdState::SentRequest {
            log::debug!("[MD] reply in state {:?} ignored", session.state);
            return;
        }
        let flags = session.flags;
        let payload = match Self::unmarshal_payload(flags, header.com_id, body, marshal) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("[MD] unmarshal comId {}: {}", header.com_id, e);
                stats.protocol_errors += 1;
                return;
            }
        };

        session.num_replies += 1;
        let num_replies = session.num_replies;
        let expected = session.expected_replies;
        stats.received += 1;

        if header.msg_type == MSG_MQ {
            // Confirmation requested: hold the session open for the app
            session.state = MdState::ReceivedReply;
            session.reply_deadline = TimeVal::ZERO;
            session.confirm_deadline = now + app_confirm_timeout;
            let deadline = session.confirm_deadline;
            let id = session.id;
            self.deadlines
                .push(Reverse((deadline, DeadlineKind::Confirm, id)));
        } else if num_replies >= expected {
            self.sessions.remove(&header.session_id);
        }

        out.push(Delivery {
            event: TrdpEvent::Md {
                listener: None,
                info: info_from_header(header, *src.ip(), num_replies, expected),
                payload,
                result: EventResult::Ok,
            },
            callback: flags.contains(Flags::CALLBACK),
        });
    }

    fn on_confirm(
        &mut self,
        header: &MdHeader,
        src: SocketAddrV4,
        stats: &mut MdStatistics,
        out: &mut Vec<Delivery>,
    ) {
        let Some(session) = self.sessions.get(&header.session_id) else {
            log::debug!("[MD] Mc for unknown session {}", header.session_id);
            return;
        };
        if session.role != MdRole::Replier || session.state != MdState::SentReply {
            log::debug!("[MD] Mc in state {:?} ignored", session.state);
            return;
        }
        let flags = session.flags;
        let listener = session.listener;
        self.sessions.remove(&header.session_id);
        stats.received += 1;
        out.push(Delivery {
            event: TrdpEvent::Md {
                listener,
                info: info_from_header(header, *src.ip(), 0, 0),
                payload: Vec::new(),
                result: EventResult::Ok,
            },
            callback: flags.contains(Flags::CALLBACK),
        });
    }

    fn on_error(
        &mut self,
        header: &MdHeader,
        src: SocketAddrV4,
        stats: &mut MdStatistics,
        out: &mut Vec<Delivery>,
    ) {
        let Some(session) = self.sessions.remove(&header.session_id) else {
            return;
        };
        stats.received += 1;
        out.push(Delivery {
            event: TrdpEvent::Md {
                listener: session.listener,
                info: info_from_header(header, *src.ip(), session.num_replies, session.expected_replies),
                payload: Vec::new(),
                result: EventResult::Aborted,
            },
            callback: session.flags.contains(Flags::CALLBACK),
        });
    }

    // ========================================================================
    // Deadline tick
    // ========================================================================

    /// Fire every expired deadline: retransmit, close with `ReplyTimeout`
    /// or `NotAllReplies`, or abort on application inaction. Counters go
    /// to the transport the session rides on.
    pub fn tick(
        &mut self,
        now: TimeVal,
        pool: &SocketPool,
        udp_stats: &mut MdStatistics,
        tcp_stats: &mut MdStatistics,
        out: &mut Vec<Delivery>,
    ) {
        while let Some(Reverse((at, kind, id))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            let Some(session) = self.sessions.get_mut(&id) else {
                continue; // lazily invalidated
            };
            let live = match kind {
                DeadlineKind::Reply => session.reply_deadline == at,
                DeadlineKind::Confirm => session.confirm_deadline == at,
            };
            if !live {
                continue;
            }
            let stats: &mut MdStatistics = if matches!(session.transport, MdTransport::Tcp(_)) {
                &mut *tcp_stats
            } else {
                &mut *udp_stats
            };
            match (kind, session.state) {
                (DeadlineKind::Reply, MdState::SentRequest) => {
                    if session.retries_left > 0 {
                        session.retries_left -= 1;
                        let deadline = now + session.reply_timeout;
                        session.reply_deadline = deadline;
                        let frame = session.stored_frame.clone();
                        let (transport, peer) = (session.transport, session.peer);
                        self.deadlines
                            .push(Reverse((deadline, DeadlineKind::Reply, id)));
                        log::debug!("[MD] retransmit session {}", id);
                        if let Err(e) = self.send_frame(transport, peer, frame, pool) {
                            log::warn!("[MD] retransmit session {}: {}", id, e);
                        } else {
                            stats.sent += 1;
                        }
                    } else {
                        let Some(session) = self.sessions.remove(&id) else {
                            continue;
                        };
                        stats.reply_timeouts += 1;
                        let partial = session.num_replies > 0;
                        out.push(Delivery {
                            event: TrdpEvent::Md {
                                listener: None,
                                info: terminal_info(&session, ReplyStatus::NoReply),
                                payload: Vec::new(),
                                result: if partial {
                                    EventResult::NotAllReplies
                                } else {
                                    EventResult::ReplyTimeout
                                },
                            },
                            callback: session.flags.contains(Flags::CALLBACK),
                        });
                    }
                }
                (DeadlineKind::Reply, MdState::ReceivedRequest) => {
                    // Local application never replied
                    let Some(session) = self.sessions.remove(&id) else {
                        continue;
                    };
                    stats.reply_timeouts += 1;
                    log::warn!("[MD] application reply timeout, session {}", id);
                    out.push(Delivery {
                        event: TrdpEvent::Md {
                            listener: session.listener,
                            info: terminal_info(&session, ReplyStatus::ApplTimeout),
                            payload: Vec::new(),
                            result: EventResult::Aborted,
                        },
                        callback: session.flags.contains(Flags::CALLBACK),
                    });
                }
                (DeadlineKind::Confirm, MdState::SentReply) => {
                    let Some(session) = self.sessions.remove(&id) else {
                        continue;
                    };
                    stats.confirm_timeouts += 1;
                    out.push(Delivery {
                        event: TrdpEvent::Md {
                            listener: session.listener,
                            info: terminal_info(&session, ReplyStatus::NoReply),
                            payload: Vec::new(),
                            result: EventResult::ConfirmTimeout,
                        },
                        callback: session.flags.contains(Flags::CALLBACK),
                    });
                }
                (DeadlineKind::Confirm, MdState::ReceivedReply) => {
                    // Local application never confirmed
                    let Some(session) = self.sessions.remove(&id) else {
                        continue;
                    };
                    stats.confirm_timeouts += 1;
                    log::warn!("[MD] application confirm timeout, session {}", id);
                    out.push(Delivery {
                        event: TrdpEvent::Md {
                            listener: None,
                            info: terminal_info(&session, ReplyStatus::ApplTimeout),
                            payload: Vec::new(),
                            result: EventResult::Aborted,
                        },
                        callback: session.flags.contains(Flags::CALLBACK),
                    });
                }
                _ => {}
            }
        }
    }

    /// Earliest deadline for `get_interval`; stale heap heads only cause a
    /// harmless early wake.
    pub fn next_deadline(&self) -> Option<TimeVal> {
        self.deadlines.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Abort every transaction riding a dead TCP connection.
    pub fn abort_connection(&mut self, conn: usize, out: &mut Vec<Delivery>) {
        let dead: Vec<Uuid> = self
            .sessions
            .values()
            .filter(|s| s.transport == MdTransport::Tcp(conn))
            .map(|s| s.id)
            .collect();
        for id in dead {
            let Some(session) = self.sessions.remove(&id) else {
                continue;
            };
            log::warn!("[MD] session {} aborted: connection {} lost", id, conn);
            out.push(Delivery {
                event: TrdpEvent::Md {
                    listener: session.listener,
                    info: terminal_info(&session, ReplyStatus::SessionAbort),
                    payload: Vec::new(),
                    result: EventResult::Io,
                },
                callback: session.flags.contains(Flags::CALLBACK),
            });
        }
    }

    /// Live transaction count (for tests and statistics).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// ComID and flags of a live transaction (marshalling on the reply
    /// path needs the schema key before the send).
    pub fn session_com_id(&self, id: Uuid) -> Option<(u32, Flags)> {
        self.sessions.get(&id).map(|s| (s.com_id, s.flags))
    }

    // ========================================================================
    // Transport plumbing
    // ========================================================================

    fn bind_transport(
        &mut self,
        flags: Flags,
        dest: SocketAddrV4,
        registry: &Registry,
    ) -> Result<MdTransport> {
        if flags.contains(Flags::TCP) {
            Ok(MdTransport::Tcp(self.tcp.connect(dest, registry)?))
        } else {
            Ok(MdTransport::Udp)
        }
    }

    fn send_frame(
        &mut self,
        transport: MdTransport,
        peer: SocketAddrV4,
        frame: Vec<u8>,
        pool: &SocketPool,
    ) -> Result<()> {
        match transport {
            MdTransport::Udp => {
                let sock = self
                    .udp_sock
                    .ok_or_else(|| Error::State("MD UDP socket not open".into()))?;
                sock::send_udp(pool.get(sock)?.socket(), &frame, peer)?;
                Ok(())
            }
            MdTransport::Tcp(conn) => self.tcp.send(conn, frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::sockets::{SockKey, SockKind};

    fn test_engine() -> (mio::Poll, SocketPool, MdEngine) {
        let poll = mio::Poll::new().expect("poll");
        let mut pool = SocketPool::new();
        let mut engine = MdEngine::new(64);
        let sock = pool
            .obtain(
                SockKey {
                    bind: Ipv4Addr::LOCALHOST,
                    port: 0,
                    qos: 0,
                    ttl: 64,
                    kind: SockKind::MdUdp,
                },
                poll.registry(),
            )
            .expect("socket");
        engine.udp_sock = Some(sock);
        (poll, pool, engine)
    }

    fn peer() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 49152)
    }

    fn request_now(
        engine: &mut MdEngine,
        pool: &SocketPool,
        registry: &Registry,
        now: TimeVal,
        retries: u8,
        expected: u32,
        stats: &mut MdStatistics,
    ) -> Uuid {
        engine
            .request(
                2000,
                peer(),
                &[1, 2, 3],
                ("a".into(), "b".into()),
                TimeVal::from_millis(500),
                expected,
                retries,
                Flags::empty(),
                now,
                (0, 0),
                pool,
                registry,
                stats,
            )
            .expect("request")
    }

    fn reply_frame(msg_type: u16, id: Uuid, payload: &[u8]) -> Vec<u8> {
        MdHeader::new(msg_type, 2000, id, (0, 0))
            .pack(payload)
            .expect("pack")
    }

    fn feed(
        engine: &mut MdEngine,
        frame: &[u8],
        now: TimeVal,
        stats: &mut MdStatistics,
        out: &mut Vec<Delivery>,
    ) {
        let marshal = MarshalConfig::new();
        engine.handle_frame(
            MdTransport::Udp,
            peer(),
            frame,
            now,
            (0, 0),
            TimeVal::from_millis(500),
            &marshal,
            stats,
            out,
        );
    }

    #[test]
    fn request_then_mp_reply_closes_the_session() {
        let (poll, pool, mut engine) = test_engine();
        let mut stats = MdStatistics::default();
        let mut out = Vec::new();
        let t0 = TimeVal::new(1, 0);

        let id = request_now(&mut engine, &pool, poll.registry(), t0, 0, 1, &mut stats);
        assert_eq!(engine.session_count(), 1);

        feed(&mut engine, &reply_frame(MSG_MP, id, &[7, 7]), t0, &mut stats, &mut out);
        assert_eq!(engine.session_count(), 0, "Mp terminates the transaction");
        assert_eq!(out.len(), 1);
        match &out[0].event {
            TrdpEvent::Md { payload, result, .. } => {
                assert_eq!(payload, &[7, 7]);
                assert_eq!(*result, EventResult::Ok);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn mq_reply_waits_for_confirm() {
        let (poll, pool, mut engine) = test_engine();
        let mut stats = MdStatistics::default();
        let mut out = Vec::new();
        let t0 = TimeVal::new(1, 0);

        let id = request_now(&mut engine, &pool, poll.registry(), t0, 0, 1, &mut stats);
        feed(&mut engine, &reply_frame(MSG_MQ, id, &[1]), t0, &mut stats, &mut out);
        assert_eq!(engine.session_count(), 1, "Mq keeps the session open");

        engine
            .confirm(id, ReplyStatus::Ok, (0, 0), &pool, &mut stats)
            .expect("confirm");
        assert_eq!(engine.session_count(), 0);
    }

    #[test]
    fn reply_timeout_retries_then_fails() {
        let (poll, pool, mut engine) = test_engine();
        let mut stats = MdStatistics::default();
        let mut out = Vec::new();
        let t0 = TimeVal::new(1, 0);
        let timeout = TimeVal::from_millis(500);

        let _id = request_now(&mut engine, &pool, poll.registry(), t0, 2, 1, &mut stats);
        assert_eq!(stats.sent, 1);

        // First expiry: retransmit 1
        engine.tick(t0 + timeout, &pool, &mut stats, &mut MdStatistics::default(), &mut out);
        assert_eq!(stats.sent, 2);
        assert!(out.is_empty());
        // Second expiry: retransmit 2
        engine.tick(t0 + timeout.scale(2), &pool, &mut stats, &mut MdStatistics::default(), &mut out);
        assert_eq!(stats.sent, 3);
        // Third expiry: retries exhausted
        engine.tick(t0 + timeout.scale(3), &pool, &mut stats, &mut MdStatistics::default(), &mut out);
        assert_eq!(stats.sent, 3, "retries=2 means at most 3 transmissions");
        assert_eq!(stats.reply_timeouts, 1);
        assert_eq!(out.len(), 1);
        match &out[0].event {
            TrdpEvent::Md { result, .. } => assert_eq!(*result, EventResult::ReplyTimeout),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(engine.session_count(), 0);
    }

    #[test]
    fn multicast_collection_not_all_replies() {
        let (poll, pool, mut engine) = test_engine();
        let mut stats = MdStatistics::default();
        let mut out = Vec::new();
        let t0 = TimeVal::new(1, 0);

        let id = request_now(&mut engine, &pool, poll.registry(), t0, 0, 3, &mut stats);
        feed(&mut engine, &reply_frame(MSG_MP, id, &[1]), t0, &mut stats, &mut out);
        assert_eq!(engine.session_count(), 1, "collecting until count or timeout");
        out.clear();

        engine.tick(t0 + TimeVal::from_millis(500), &pool, &mut stats, &mut MdStatistics::default(), &mut out);
        assert_eq!(out.len(), 1);
        match &out[0].event {
            TrdpEvent::Md { result, info, .. } => {
                assert_eq!(*result, EventResult::NotAllReplies);
                assert_eq!(info.num_replies, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn multicast_collection_completes_on_count() {
        let (poll, pool, mut engine) = test_engine();
        let mut stats = MdStatistics::default();
        let mut out = Vec::new();
        let t0 = TimeVal::new(1, 0);

        let id = request_now(&mut engine, &pool, poll.registry(), t0, 0, 2, &mut stats);
        feed(&mut engine, &reply_frame(MSG_MP, id, &[1]), t0, &mut stats, &mut out);
        // Second replier's frame has a different source in reality; the
        // session key is what matters here
        feed(&mut engine, &reply_frame(MSG_MP, id, &[2]), t0, &mut stats, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(engine.session_count(), 0, "expected count reached");
    }

    #[test]
    fn listener_dispatch_and_reply_path() {
        let (poll, pool, mut engine) = test_engine();
        let mut stats = MdStatistics::default();
        let mut out = Vec::new();
        let t0 = TimeVal::new(1, 0);

        engine.add_listener(Listener {
            com_id: 2000,
            uri: String::new(),
            flags: Flags::empty(),
        });

        // Incoming request with a 500 ms application window
        let mut header = MdHeader::new(MSG_MR, 2000, Uuid([9; 16]), (0, 0));
        header.reply_timeout = 500_000;
        let frame = header.pack(&[5, 5]).expect("pack");
        feed(&mut engine, &frame, t0, &mut stats, &mut out);

        assert_eq!(engine.session_count(), 1);
        assert_eq!(out.len(), 1);
        match &out[0].event {
            TrdpEvent::Md { listener, payload, .. } => {
                assert!(listener.is_some());
                assert_eq!(payload, &[5, 5]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        engine
            .reply(
                Uuid([9; 16]),
                &[6],
                ReplyStatus::Ok,
                (String::new(), String::new()),
                (0, 0),
                &pool,
                &mut stats,
            )
            .expect("reply");
        assert_eq!(engine.session_count(), 0);
    }

    #[test]
    fn unanswered_request_aborts_on_app_timeout() {
        let (poll, pool, mut engine) = test_engine();
        let _ = poll;
        let mut stats = MdStatistics::default();
        let mut out = Vec::new();
        let t0 = TimeVal::new(1, 0);

        engine.add_listener(Listener {
            com_id: 2000,
            uri: String::new(),
            flags: Flags::empty(),
        });
        let mut header = MdHeader::new(MSG_MR, 2000, Uuid([8; 16]), (0, 0));
        header.reply_timeout = 100_000;
        feed(&mut engine, &header.pack(&[]).expect("pack"), t0, &mut stats, &mut out);
        out.clear();

        engine.tick(t0 + TimeVal::from_millis(150), &pool, &mut stats, &mut MdStatistics::default(), &mut out);
        assert_eq!(engine.session_count(), 0);
        match &out[0].event {
            TrdpEvent::Md { result, info, .. } => {
                assert_eq!(*result, EventResult::Aborted);
                assert_eq!(info.reply_status, ReplyStatus::ApplTimeout);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn reply_query_times_out_without_confirm() {
        let (poll, pool, mut engine) = test_engine();
        let _ = poll;
        let mut stats = MdStatistics::default();
        let mut out = Vec::new();
        let t0 = TimeVal::new(1, 0);
        let id = Uuid([7; 16]);

        engine.add_listener(Listener {
            com_id: 2000,
            uri: String::new(),
            flags: Flags::empty(),
        });
        let header = MdHeader::new(MSG_MR, 2000, id, (0, 0));
        feed(&mut engine, &header.pack(&[]).expect("pack"), t0, &mut stats, &mut out);
        out.clear();

        engine
            .reply_query(
                id,
                &[1],
                ReplyStatus::Ok,
                (String::new(), String::new()),
                TimeVal::from_millis(500),
                t0,
                (0, 0),
                &pool,
                &mut stats,
            )
            .expect("reply_query");

        // Mc never arrives
        engine.tick(t0 + TimeVal::from_millis(600), &pool, &mut stats, &mut MdStatistics::default(), &mut out);
        assert_eq!(stats.confirm_timeouts, 1);
        match &out[0].event {
            TrdpEvent::Md { result, .. } => assert_eq!(*result, EventResult::ConfirmTimeout),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn confirm_closes_replier_session() {
        let (poll, pool, mut engine) = test_engine();
        let _ = poll;
        let mut stats = MdStatistics::default();
        let mut out = Vec::new();
        let t0 = TimeVal::new(1, 0);
        let id = Uuid([6; 16]);

        engine.add_listener(Listener {
            com_id: 2000,
            uri: String::new(),
            flags: Flags::empty(),
        });
        feed(
            &mut engine,
            &MdHeader::new(MSG_MR, 2000, id, (0, 0)).pack(&[]).expect("pack"),
            t0,
            &mut stats,
            &mut out,
        );
        engine
            .reply_query(
                id,
                &[1],
                ReplyStatus::Ok,
                (String::new(), String::new()),
                TimeVal::from_millis(500),
                t0,
                (0, 0),
                &pool,
                &mut stats,
            )
            .expect("reply_query");
        out.clear();

        feed(&mut engine, &reply_frame(MSG_MC, id, &[]), t0, &mut stats, &mut out);
        assert_eq!(engine.session_count(), 0);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn state_errors_are_rejected() {
        let (poll, pool, mut engine) = test_engine();
        let mut stats = MdStatistics::default();
        let t0 = TimeVal::new(1, 0);

        assert!(matches!(
            engine.confirm(Uuid([1; 16]), ReplyStatus::Ok, (0, 0), &pool, &mut stats),
            Err(Error::NoSession)
        ));

        let id = request_now(&mut engine, &pool, poll.registry(), t0, 0, 1, &mut stats);
        // Requester cannot reply to its own request
        assert!(matches!(
            engine.reply(id, &[], ReplyStatus::Ok, (String::new(), String::new()), (0, 0), &pool, &mut stats),
            Err(Error::State(_))
        ));
        // Confirm before any Mq is a state error
        assert!(matches!(
            engine.confirm(id, ReplyStatus::Ok, (0, 0), &pool, &mut stats),
            Err(Error::State(_))
        ));
    }

    #[test]
    fn uri_filter_selects_listener() {
        let (poll, pool, mut engine) = test_engine();
        let _ = (poll, pool);
        let mut stats = MdStatistics::default();
        let mut out = Vec::new();

        engine.add_listener(Listener {
            com_id: 2000,
            uri: "deviceB".into(),
            flags: Flags::empty(),
        });
        let mut header = MdHeader::new(MSG_MN, 2000, Uuid([5; 16]), (0, 0));
        header.dest_uri = "deviceC".into();
        feed(&mut engine, &header.pack(&[]).expect("pack"), TimeVal::new(1, 0), &mut stats, &mut out);
        assert!(out.is_empty());
        assert_eq!(stats.no_listener, 1);

        header.dest_uri = "deviceB".into();
        feed(&mut engine, &header.pack(&[]).expect("pack"), TimeVal::new(1, 0), &mut stats, &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn session_table_is_bounded() {
        let (poll, pool, mut engine) = test_engine();
        engine.max_sessions = 2;
        let mut stats = MdStatistics::default();
        let t0 = TimeVal::new(1, 0);
        request_now(&mut engine, &pool, poll.registry(), t0, 0, 1, &mut stats);
        request_now(&mut engine, &pool, poll.registry(), t0, 0, 1, &mut stats);
        let third = engine.request(
            2000,
            peer(),
            &[],
            (String::new(), String::new()),
            TimeVal::from_millis(100),
            1,
            0,
            Flags::empty(),
            t0,
            (0, 0),
            &pool,
            poll.registry(),
            &mut stats,
        );
        assert!(matches!(third, Err(Error::State(_))));
    }

    #[test]
    fn abort_connection_kills_tcp_sessions_only() {
        let (poll, pool, mut engine) = test_engine();
        let mut stats = MdStatistics::default();
        let mut out = Vec::new();
        let t0 = TimeVal::new(1, 0);
        let udp_id = request_now(&mut engine, &pool, poll.registry(), t0, 0, 1, &mut stats);

        // Fabricate a TCP-bound replier session
        engine.sessions.insert(
            Uuid([3; 16]),
            MdSession {
                id: Uuid([3; 16]),
                role: MdRole::Replier,
                transport: MdTransport::Tcp(4),
                state: MdState::ReceivedRequest,
                com_id: 2000,
                peer: peer(),
                reply_deadline: TimeVal::ZERO,
                confirm_deadline: TimeVal::ZERO,
                retries_left: 0,
                expected_replies: 0,
                num_replies: 0,
                stored_frame: Vec::new(),
                listener: None,
                flags: Flags::empty(),
                reply_timeout: TimeVal::ZERO,
            },
        );

        engine.abort_connection(4, &mut out);
        assert_eq!(out.len(), 1);
        match &out[0].event {
            TrdpEvent::Md { result, .. } => assert_eq!(*result, EventResult::Io),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(engine.session_count(), 1, "UDP session survives");
        engine.abort(udp_id).expect("abort");
    }
}
