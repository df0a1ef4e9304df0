// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # TRDP Public API types
//!
//! Error taxonomy, telegram option flags, entity handles and the delivery
//! event/metadata types shared by the PD and MD engines.
//!
//! ## Overview
//!
//! Every public operation of the stack returns [`Result`]. The single flat
//! [`Error`] enum covers all layers, from OS-abstraction failures to
//! protocol-level deadline expiry. Frame-level rejections (CRC, version,
//! topography, unknown ComID) exist as variants for internal bookkeeping but
//! are never returned by the public API: per IEC 61375-2-3 they are counted
//! in the session statistics and the frame is dropped.
//!
//! Deliveries are expressed twice, host's choice:
//!
//! - as [`TrdpEvent`] values returned from `Session::process` (pull model)
//! - as callbacks invoked inside `process` for entities registered with
//!   [`Flags::CALLBACK`] (push model)
//!
//! Callbacks must not re-enter `process`.

use std::fmt;

use crate::vos::uuid::Uuid;

// ============================================================================
// Result / Error
// ============================================================================

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by TRDP operations.
///
/// One flat enum for the whole stack; grouping follows the protocol error
/// taxonomy rather than the module tree.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Parameter / lifecycle
    // ========================================================================
    /// Argument out of range, or empty where content is required.
    Param(String),
    /// `init` called twice, or a session opened before `init`.
    Init,
    /// Operation on a session that was never opened or already closed.
    NoInit,
    /// Call made in a state where it is not legal (MD state machine).
    State(String),

    // ========================================================================
    // Protocol deadlines
    // ========================================================================
    /// Protocol-level deadline fired (PD subscription ran dry).
    Timeout,
    /// The peer application did not answer within the negotiated time.
    AppTimeout,
    /// Local application failed to call `reply` in time.
    AppReplyTimeout,
    /// Local application failed to call `confirm` in time.
    AppConfirmTimeout,
    /// No reply arrived within the reply timeout (all retries spent).
    ReplyTimeout,
    /// No confirmation arrived within the confirm timeout.
    ConfirmTimeout,
    /// Requested confirmation was never sent by the requester.
    ReqConfirmTimeout,
    /// Multicast request: fewer replies than expected before the timeout.
    NotAllReplies,

    // ========================================================================
    // I/O
    // ========================================================================
    /// Non-blocking receive found no pending datagram.
    NoData,
    /// Non-blocking operation would have blocked.
    Block,
    /// Socket create/bind/option failure.
    Sock(String),
    /// I/O error with underlying cause.
    Io(std::io::Error),

    // ========================================================================
    // OS abstraction
    // ========================================================================
    /// Allocator exhausted, or destination buffer too small.
    Mem,
    /// Semaphore take failed or timed out.
    Sema,
    /// Mutex could not be acquired (`try_lock` on a held lock).
    MutexInUse,
    /// Queue receive on an empty queue (after the given timeout).
    Queue,
    /// Queue send on a full queue.
    QueueFull,
    /// Thread spawn/join failure.
    Thread,

    // ========================================================================
    // Frame rejection (counted + dropped on receive, never user-visible)
    // ========================================================================
    /// Header or payload CRC mismatch.
    Crc,
    /// Protocol version mismatch or unknown message type.
    Wire,
    /// Topography counter disagrees with the local expected value.
    Topo,
    /// ComID not known to any subscriber, listener or schema.
    ComId,

    // ========================================================================
    // Entity lookup
    // ========================================================================
    /// Referenced MD transaction does not exist.
    NoSession,
    /// MD transaction was aborted by API or transport failure.
    SessionAbort,
    /// Referenced subscriber does not exist.
    NoSubscriber,
    /// Referenced publisher does not exist.
    NoPublisher,
    /// Referenced listener does not exist.
    NoListener,

    // ========================================================================
    // Other
    // ========================================================================
    /// Build-time assumption violated (alignment/endian probe failed).
    Integration,
    /// Catch-all; should not be observable in a healthy deployment.
    Unknown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Parameter / lifecycle
            Error::Param(msg) => write!(f, "parameter error: {}", msg),
            Error::Init => write!(f, "lifecycle misuse: already initialised"),
            Error::NoInit => write!(f, "lifecycle misuse: not initialised"),
            Error::State(msg) => write!(f, "call in wrong state: {}", msg),
            // Deadlines
            Error::Timeout => write!(f, "protocol timeout"),
            Error::AppTimeout => write!(f, "application timeout"),
            Error::AppReplyTimeout => write!(f, "application reply timeout"),
            Error::AppConfirmTimeout => write!(f, "application confirm timeout"),
            Error::ReplyTimeout => write!(f, "reply timeout (retries exhausted)"),
            Error::ConfirmTimeout => write!(f, "confirm timeout"),
            Error::ReqConfirmTimeout => write!(f, "requested confirmation timeout"),
            Error::NotAllReplies => write!(f, "fewer replies than expected"),
            // I/O
            Error::NoData => write!(f, "no data pending"),
            Error::Block => write!(f, "operation would block"),
            Error::Sock(msg) => write!(f, "socket error: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            // OSA
            Error::Mem => write!(f, "out of memory"),
            Error::Sema => write!(f, "semaphore error"),
            Error::MutexInUse => write!(f, "mutex in use"),
            Error::Queue => write!(f, "queue empty"),
            Error::QueueFull => write!(f, "queue full"),
            Error::Thread => write!(f, "thread error"),
            // Frame rejection
            Error::Crc => write!(f, "frame CRC mismatch"),
            Error::Wire => write!(f, "frame protocol mismatch"),
            Error::Topo => write!(f, "frame topo counter mismatch"),
            Error::ComId => write!(f, "unknown ComID"),
            // Entity lookup
            Error::NoSession => write!(f, "no such MD session"),
            Error::SessionAbort => write!(f, "MD session aborted"),
            Error::NoSubscriber => write!(f, "no such subscriber"),
            Error::NoPublisher => write!(f, "no such publisher"),
            Error::NoListener => write!(f, "no such listener"),
            // Other
            Error::Integration => write!(f, "build-time assumption violated"),
            Error::Unknown => write!(f, "unknown error"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock => Error::Block,
            _ => Error::Io(e),
        }
    }
}

// ============================================================================
// Option flags
// ============================================================================

bitflags::bitflags! {
    /// Per-telegram option flags, combinable on `publish`, `subscribe` and
    /// the MD calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u8 {
        /// Run the dataset marshaller over the payload (schema by ComID).
        const MARSHALL = 0x01;
        /// Deliver via the registered callback instead of the event queue.
        const CALLBACK = 0x02;
        /// Use TCP instead of UDP (MD only).
        const TCP = 0x04;
        /// Invoke the callback even for payload-less status indications.
        const FORCE_CALLBACK = 0x08;
        /// `put` on this publisher resets its send deadline (push on change).
        const PUSH_ON_CHANGE = 0x10;
    }
}

/// What happens to a subscriber's cached payload when its timeout fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutBehaviour {
    /// Cached payload is zeroed; the timeout indication carries zeroes.
    #[default]
    Zero,
    /// Cached payload is kept; the timeout indication carries the last value.
    KeepLast,
}

/// Redundancy arbitration state of a publisher group.
///
/// Arbitration itself is external (IEC 61375-2-3 leaves it to the train
/// control layer); the engine only honours the current flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Redundancy {
    /// Publishers of the group transmit normally.
    #[default]
    Leader,
    /// Publishers of the group suppress transmission.
    Follower,
}

/// Per-telegram network send parameters; `None` fields fall back to the
/// session defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendParam {
    /// DSCP traffic class for outgoing frames.
    pub qos: Option<u8>,
    /// IP time-to-live for outgoing frames.
    pub ttl: Option<u8>,
    /// MD only: retransmissions before `ReplyTimeout`.
    pub retries: Option<u8>,
}

// ============================================================================
// Entity handles
// ============================================================================

/// Stable handle to a registered publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubHandle(pub(crate) u32);

/// Stable handle to a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubHandle(pub(crate) u32);

/// Stable handle to a registered MD listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(pub(crate) u32);

// ============================================================================
// Reply status (MD wire field)
// ============================================================================

/// Signed status word carried in every MD frame.
///
/// Zero means success; negative values report why a replier could not
/// produce a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyStatus {
    /// Reply carries valid user data.
    #[default]
    Ok,
    /// Replier application did not answer in time.
    ApplTimeout,
    /// Replier session was aborted.
    SessionAbort,
    /// No replier instance for the requested ComID.
    NoReplierInstance,
    /// Replier ran out of memory building the reply.
    NoMemRepl,
    /// Requester ran out of memory accepting the reply.
    NoMemLocal,
    /// Listener matched but produced no reply.
    NoReply,
    /// Reserved / vendor specific.
    NotSpecified,
}

impl ReplyStatus {
    /// Wire encoding (signed 32-bit, network byte order on the frame).
    pub fn as_i32(self) -> i32 {
        match self {
            ReplyStatus::Ok => 0,
            ReplyStatus::ApplTimeout => -1,
            ReplyStatus::SessionAbort => -2,
            ReplyStatus::NoReplierInstance => -3,
            ReplyStatus::NoMemRepl => -4,
            ReplyStatus::NoMemLocal => -5,
            ReplyStatus::NoReply => -6,
            ReplyStatus::NotSpecified => -99,
        }
    }

    /// Decode from the wire; unknown negative codes map to `NotSpecified`.
    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => ReplyStatus::Ok,
            -1 => ReplyStatus::ApplTimeout,
            -2 => ReplyStatus::SessionAbort,
            -3 => ReplyStatus::NoReplierInstance,
            -4 => ReplyStatus::NoMemRepl,
            -5 => ReplyStatus::NoMemLocal,
            -6 => ReplyStatus::NoReply,
            _ => ReplyStatus::NotSpecified,
        }
    }
}

// ============================================================================
// Delivery metadata
// ============================================================================

/// Result code attached to a delivery event or callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    /// Regular data indication.
    Ok,
    /// PD subscription or pull request ran into its timeout.
    Timeout,
    /// MD reply timeout after all retries.
    ReplyTimeout,
    /// MD confirm timeout.
    ConfirmTimeout,
    /// Multicast request closed with fewer replies than expected.
    NotAllReplies,
    /// Session was aborted (API or transport failure).
    Aborted,
    /// Transport-level I/O failure on the session's connection.
    Io,
}

/// Metadata accompanying a PD indication.
#[derive(Debug, Clone)]
pub struct PdInfo {
    /// ComID of the telegram.
    pub com_id: u32,
    /// Source address of the frame (0.0.0.0 for locally generated events).
    pub src_ip: std::net::Ipv4Addr,
    /// Destination the frame was addressed to.
    pub dst_ip: std::net::Ipv4Addr,
    /// ETB topography counter from the frame.
    pub etb_topo_cnt: u32,
    /// Operational train topography counter from the frame.
    pub op_trn_topo_cnt: u32,
    /// Sequence counter assigned by the publisher.
    pub seq_count: u32,
    /// Protocol version of the frame.
    pub protocol_version: u16,
    /// Wire message type of the frame.
    pub msg_type: u16,
    /// ComID a pull reply was requested on (Pr frames).
    pub reply_com_id: u32,
    /// Address a pull reply was requested to (Pr frames).
    pub reply_ip: std::net::Ipv4Addr,
}

/// Metadata accompanying an MD indication.
#[derive(Debug, Clone)]
pub struct MdInfo {
    /// ComID of the telegram.
    pub com_id: u32,
    /// Wire message type of the frame.
    pub msg_type: u16,
    /// Transaction UUID.
    pub session_id: Uuid,
    /// Source address of the frame.
    pub src_ip: std::net::Ipv4Addr,
    /// ETB topography counter from the frame.
    pub etb_topo_cnt: u32,
    /// Operational train topography counter from the frame.
    pub op_trn_topo_cnt: u32,
    /// Replies still expected on a multicast request (0 = unconstrained).
    pub num_expected_replies: u32,
    /// Replies received so far on this transaction.
    pub num_replies: u32,
    /// Status word from the frame.
    pub reply_status: ReplyStatus,
    /// Source user URI (zero-padded 32 octets on the wire).
    pub src_uri: String,
    /// Destination user URI (zero-padded 32 octets on the wire).
    pub dest_uri: String,
}

/// Delivery event returned by `Session::process` (pull model).
#[derive(Debug)]
pub enum TrdpEvent {
    /// PD indication for a subscriber: fresh data or a timeout.
    Pd {
        /// Subscriber the indication belongs to.
        handle: SubHandle,
        /// Frame metadata (last accepted frame on timeouts).
        info: PdInfo,
        /// Payload after unmarshalling; zeroed on `TimeoutBehaviour::Zero`.
        payload: Vec<u8>,
        /// `Ok` or `Timeout`.
        result: EventResult,
    },
    /// MD indication: request/notify for a listener, reply/confirm or a
    /// terminal error for a requester session.
    Md {
        /// Listener the indication belongs to, for `Mn`/`Mr` dispatch.
        listener: Option<ListenerHandle>,
        /// Frame metadata.
        info: MdInfo,
        /// Payload after unmarshalling.
        payload: Vec<u8>,
        /// Delivery result; terminal errors carry the empty payload.
        result: EventResult,
    },
}

/// Callback signature for PD indications (push model).
pub type PdCallback = Box<dyn FnMut(&PdInfo, &[u8], EventResult) + Send>;

/// Callback signature for MD indications (push model).
pub type MdCallback = Box<dyn FnMut(&MdInfo, &[u8], EventResult) + Send>;
