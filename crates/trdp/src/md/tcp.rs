// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP transport for message data.
//!
//! One server socket bound to the MD TCP port accepts connections; each
//! accepted or outgoing connection is a session-scoped stream carrying
//! back-to-back MD frames, reassembled by [`StreamAssembler`]. Connection
//! errors surface as `Io` to the engine, which aborts every transaction
//! riding the connection.
//!
//! # Connection states
//!
//! ```text
//!   Idle --connect()--> Connecting --writable--> Connected --EOF/error--> Closed
//!                 accept() ----------------------^
//! ```

use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};

use crate::api::{Error, Result};
use crate::protocol::md::StreamAssembler;
use crate::session::sockets::TOKEN_TCP_BASE;
use crate::vos::sock::{self, SocketOptions};

/// Token of the MD TCP server socket.
pub const TOKEN_TCP_LISTENER: usize = TOKEN_TCP_BASE;

/// First connection token; connection `i` uses `TOKEN_TCP_CONN_BASE + i`.
pub const TOKEN_TCP_CONN_BASE: usize = TOKEN_TCP_BASE + 1;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Non-blocking connect in flight.
    Connecting,
    /// Stream established, frames may flow.
    Connected,
    /// Terminal; awaiting cleanup.
    Closed,
}

pub(crate) struct TcpConn {
    std: TcpStream,
    mio: mio::net::TcpStream,
    pub peer: SocketAddrV4,
    pub state: ConnState,
    assembler: StreamAssembler,
    send_queue: VecDeque<Vec<u8>>,
    /// Bytes of the queue front already written.
    send_offset: usize,
}

/// MD TCP server + connection table.
#[derive(Default)]
pub(crate) struct TcpTransport {
    listener: Option<(TcpListener, mio::net::TcpListener)>,
    conns: Vec<Option<TcpConn>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport::default()
    }

    /// True once the server socket exists.
    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Bind and register the MD TCP server socket (idempotent).
    pub fn ensure_listener(
        &mut self,
        bind: Ipv4Addr,
        port: u16,
        registry: &Registry,
    ) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let std = sock::open_tcp_listener(bind, port, &SocketOptions::default())?;
        let mut mio_l = mio::net::TcpListener::from_std(std.try_clone().map_err(Error::Io)?);
        registry
            .register(&mut mio_l, Token(TOKEN_TCP_LISTENER), Interest::READABLE)
            .map_err(Error::Io)?;
        log::info!("[MD] TCP listener on {}:{}", bind, port);
        self.listener = Some((std, mio_l));
        Ok(())
    }

    fn insert(&mut self, conn: TcpConn, registry: &Registry) -> Result<usize> {
        let idx = self
            .conns
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.conns.len());
        let mut conn = conn;
        registry
            .register(
                &mut conn.mio,
                Token(TOKEN_TCP_CONN_BASE + idx),
                Interest::READABLE | Interest::WRITABLE,
            )
            .map_err(Error::Io)?;
        if idx == self.conns.len() {
            self.conns.push(Some(conn));
        } else {
            self.conns[idx] = Some(conn);
        }
        Ok(idx)
    }

    /// Reuse or open a connection toward `peer`.
    pub fn connect(&mut self, peer: SocketAddrV4, registry: &Registry) -> Result<usize> {
        if let Some(idx) = self.conns.iter().position(|c| {
            c.as_ref()
                .is_some_and(|c| c.peer == peer && c.state != ConnState::Closed)
        }) {
            return Ok(idx);
        }
        let std = sock::connect_tcp(peer, &SocketOptions::default())?;
        let mio_s = mio::net::TcpStream::from_std(std.try_clone().map_err(Error::Io)?);
        self.insert(
            TcpConn {
                std,
                mio: mio_s,
                peer,
                state: ConnState::Connecting,
                assembler: StreamAssembler::new(),
                send_queue: VecDeque::new(),
                send_offset: 0,
            },
            registry,
        )
    }

    /// Accept every pending connection; returns the new indices.
    pub fn accept_ready(&mut self, registry: &Registry) -> Vec<usize> {
        let mut accepted = Vec::new();
        loop {
            let Some((listener, _)) = &self.listener else {
                return accepted;
            };
            match sock::accept_tcp(listener) {
                Ok((stream, SocketAddr::V4(peer))) => {
                    let mio_s = match stream.try_clone().map(mio::net::TcpStream::from_std) {
                        Ok(s) => s,
                        Err(e) => {
                            log::warn!("[MD] accept clone failed: {}", e);
                            continue;
                        }
                    };
                    match self.insert(
                        TcpConn {
                            std: stream,
                            mio: mio_s,
                            peer,
                            state: ConnState::Connected,
                            assembler: StreamAssembler::new(),
                            send_queue: VecDeque::new(),
                            send_offset: 0,
                        },
                        registry,
                    ) {
                        Ok(idx) => {
                            log::debug!("[MD] accepted {} as conn {}", peer, idx);
                            accepted.push(idx);
                        }
                        Err(e) => log::warn!("[MD] accept register failed: {}", e),
                    }
                }
                Ok((_, SocketAddr::V6(peer))) => {
                    log::debug!("[MD] dropping IPv6 connection from {}", peer);
                }
                Err(Error::NoData) => return accepted,
                Err(e) => {
                    log::warn!("[MD] accept failed: {}", e);
                    return accepted;
                }
            }
        }
    }

    /// Queue a frame; flushes immediately when the stream is writable.
    pub fn send(&mut self, idx: usize, frame: Vec<u8>) -> Result<()> {
        let conn = self.conn_mut(idx)?;
        if conn.state == ConnState::Closed {
            return Err(Error::Io(std::io::Error::other("connection closed")));
        }
        conn.send_queue.push_back(frame);
        if conn.state == ConnState::Connected {
            conn.flush()?;
        }
        Ok(())
    }

    /// Writable readiness: completes a pending connect, then drains the
    /// send queue.
    pub fn handle_writable(&mut self, idx: usize) -> Result<()> {
        let conn = self.conn_mut(idx)?;
        if conn.state == ConnState::Connecting {
            // A connect error is reported through take_error once writable
            if let Ok(Some(e)) | Err(e) = conn.std.take_error() {
                conn.state = ConnState::Closed;
                return Err(Error::Io(e));
            }
            conn.state = ConnState::Connected;
            log::debug!("[MD] conn {} connected to {}", idx, conn.peer);
        }
        conn.flush()
    }

    /// Readable readiness: drain the stream, return complete frames and
    /// whether the peer closed.
    pub fn handle_readable(&mut self, idx: usize) -> Result<(Vec<Vec<u8>>, bool)> {
        let conn = self.conn_mut(idx)?;
        let mut closed = false;
        let mut buf = [0u8; 16384];
        loop {
            match conn.std.read(&mut buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => conn.assembler.push(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    conn.state = ConnState::Closed;
                    return Err(Error::Io(e));
                }
            }
        }

        let mut frames = Vec::new();
        loop {
            match conn.assembler.take_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(_) => {
                    // Corrupt length framing: the stream is unusable
                    conn.state = ConnState::Closed;
                    closed = true;
                    break;
                }
            }
        }
        if closed {
            conn.state = ConnState::Closed;
        }
        Ok((frames, closed))
    }

    /// Deregister and drop a connection.
    pub fn close(&mut self, idx: usize, registry: &Registry) {
        if let Some(mut conn) = self.conns.get_mut(idx).and_then(Option::take) {
            let _ = registry.deregister(&mut conn.mio);
            let _ = conn.std.shutdown(std::net::Shutdown::Both);
            log::debug!("[MD] conn {} to {} closed", idx, conn.peer);
        }
    }

    /// Peer address of a live connection.
    pub fn peer(&self, idx: usize) -> Option<SocketAddrV4> {
        self.conns.get(idx).and_then(Option::as_ref).map(|c| c.peer)
    }

    fn conn_mut(&mut self, idx: usize) -> Result<&mut TcpConn> {
        self.conns
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::Sock(format!("stale connection index {}", idx)))
    }
}

impl TcpConn {
    fn flush(&mut self) -> Result<()> {
        while let Some(front) = self.send_queue.front() {
            match self.std.write(&front[self.send_offset..]) {
                Ok(n) => {
                    self.send_offset += n;
                    if self.send_offset >= front.len() {
                        self.send_queue.pop_front();
                        self.send_offset = 0;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = ConnState::Closed;
                    return Err(Error::Io(e));
                }
            }
        }
        Ok(())
    }
}
