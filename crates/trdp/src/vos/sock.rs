// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP/TCP socket helpers.
//!
//! Creation goes through `socket2` so QoS (DSCP), TTL, address reuse and
//! non-blocking mode are applied before the first bind; the resulting
//! `std::net` socket is the primary handle. The event loop clones it for
//! `mio` registration (dup'd descriptors share the socket, so multicast
//! membership and options stay in sync).
//!
//! Non-blocking error mapping: a receive that finds nothing pending is
//! `NoData`, a send that cannot take the bytes right now is `Block`.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};

use crate::api::{Error, Result};

/// Default multicast TTL (administratively scoped train backbone).
pub const DEFAULT_MULTICAST_TTL: u8 = 64;

/// Socket options applied at open time.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    /// DSCP traffic class (6 bit); shifted into the ToS byte.
    pub qos: u8,
    /// Unicast TTL.
    pub ttl: u8,
    /// SO_REUSEADDR.
    pub reuse_addr: bool,
    /// Non-blocking mode; the engine always runs non-blocking.
    pub no_blocking: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            qos: 0,
            ttl: 64,
            reuse_addr: true,
            no_blocking: true,
        }
    }
}

fn apply_common(sock: &Socket, opts: &SocketOptions) -> io::Result<()> {
    if opts.reuse_addr {
        sock.set_reuse_address(true)?;
    }
    sock.set_ttl(u32::from(opts.ttl))?;
    // DSCP sits in the upper six bits of the ToS byte. Non-fatal: some
    // container runtimes refuse IP_TOS.
    if let Err(e) = sock.set_tos(u32::from(opts.qos) << 2) {
        log::warn!("[SOCK] set_tos(dscp={}) failed (non-fatal): {}", opts.qos, e);
    }
    if opts.no_blocking {
        sock.set_nonblocking(true)?;
    }
    Ok(())
}

/// Open a UDP socket bound to `(bind_ip, port)`. Port 0 selects an
/// ephemeral port (send-only sockets).
pub fn open_udp(bind_ip: Ipv4Addr, port: u16, opts: &SocketOptions) -> Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::Sock(format!("udp socket create: {}", e)))?;
    apply_common(&sock, opts).map_err(|e| Error::Sock(format!("udp socket options: {}", e)))?;
    sock.set_multicast_ttl_v4(u32::from(DEFAULT_MULTICAST_TTL))
        .map_err(|e| Error::Sock(format!("multicast ttl: {}", e)))?;
    sock.set_multicast_loop_v4(true)
        .map_err(|e| Error::Sock(format!("multicast loop: {}", e)))?;

    let addr = SocketAddr::V4(SocketAddrV4::new(bind_ip, port));
    sock.bind(&addr.into())
        .map_err(|e| Error::Sock(format!("udp bind {}: {}", addr, e)))?;
    log::debug!("[SOCK] udp open bind={} qos={} ttl={}", addr, opts.qos, opts.ttl);
    Ok(sock.into())
}

/// Join `group` on `iface` (UNSPECIFIED lets the kernel route the join).
///
/// An already-joined group on the same physical interface is tolerated.
pub fn join_mc(sock: &UdpSocket, group: Ipv4Addr, iface: Ipv4Addr) -> Result<()> {
    match sock.join_multicast_v4(&group, &iface) {
        Ok(()) => {
            log::debug!("[SOCK] join_multicast_v4({}) on {}", group, iface);
            Ok(())
        }
        // EADDRINUSE (98) Linux: already joined on same physical NIC
        Err(e) if e.raw_os_error() == Some(98) => {
            log::debug!("[SOCK] join_multicast_v4({}) on {} - already joined", group, iface);
            Ok(())
        }
        Err(e) => Err(Error::Sock(format!("join {} on {}: {}", group, iface, e))),
    }
}

/// Leave `group` on `iface`. A group that was never joined is tolerated.
pub fn leave_mc(sock: &UdpSocket, group: Ipv4Addr, iface: Ipv4Addr) -> Result<()> {
    match sock.leave_multicast_v4(&group, &iface) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(99) || e.raw_os_error() == Some(49) => Ok(()),
        Err(e) => Err(Error::Sock(format!("leave {} on {}: {}", group, iface, e))),
    }
}

/// Select the outgoing interface for multicast sends on `sock`.
pub fn set_multicast_if(sock: &UdpSocket, iface: Ipv4Addr) -> Result<()> {
    SockRef::from(sock)
        .set_multicast_if_v4(&iface)
        .map_err(|e| Error::Sock(format!("set_multicast_if {}: {}", iface, e)))
}

/// Send one datagram. `Block` when the kernel buffer is full.
pub fn send_udp(sock: &UdpSocket, buf: &[u8], dst: SocketAddrV4) -> Result<usize> {
    sock.send_to(buf, SocketAddr::V4(dst)).map_err(Error::from)
}

/// Receive one datagram. `NoData` when nothing is pending.
///
/// Returns `(length, source ip, source port)`. The destination address of a
/// multicast datagram is implied by the socket it arrived on: sockets here
/// are bound/joined per destination group, so no ancillary data is needed.
pub fn receive_udp(sock: &UdpSocket, buf: &mut [u8]) -> Result<(usize, Ipv4Addr, u16)> {
    match sock.recv_from(buf) {
        Ok((n, SocketAddr::V4(src))) => Ok((n, *src.ip(), src.port())),
        Ok((n, SocketAddr::V6(src))) => {
            log::debug!("[SOCK] dropped {} B datagram from IPv6 source {}", n, src);
            Err(Error::NoData)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::NoData),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Open a listening TCP socket bound to `(bind_ip, port)`.
pub fn open_tcp_listener(bind_ip: Ipv4Addr, port: u16, opts: &SocketOptions) -> Result<TcpListener> {
    let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::Sock(format!("tcp socket create: {}", e)))?;
    apply_common(&sock, opts).map_err(|e| Error::Sock(format!("tcp socket options: {}", e)))?;
    let addr = SocketAddr::V4(SocketAddrV4::new(bind_ip, port));
    sock.bind(&addr.into())
        .map_err(|e| Error::Sock(format!("tcp bind {}: {}", addr, e)))?;
    sock.listen(16)
        .map_err(|e| Error::Sock(format!("tcp listen {}: {}", addr, e)))?;
    log::debug!("[SOCK] tcp listen {}", addr);
    Ok(sock.into())
}

/// Accept one pending connection; `NoData` when none is waiting.
pub fn accept_tcp(listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
    match listener.accept() {
        Ok((stream, peer)) => {
            stream.set_nonblocking(true)?;
            stream.set_nodelay(true)?;
            Ok((stream, peer))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::NoData),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Begin a non-blocking connect to `dst`.
///
/// The returned stream is usually still connecting; the caller watches for
/// writability before sending.
pub fn connect_tcp(dst: SocketAddrV4, opts: &SocketOptions) -> Result<TcpStream> {
    let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::Sock(format!("tcp socket create: {}", e)))?;
    apply_common(&sock, opts).map_err(|e| Error::Sock(format!("tcp socket options: {}", e)))?;
    match sock.connect(&SocketAddr::V4(dst).into()) {
        Ok(()) => {}
        // EINPROGRESS: the normal non-blocking connect path
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(115) => {}
        Err(e) => return Err(Error::Sock(format!("tcp connect {}: {}", dst, e))),
    }
    let stream: TcpStream = sock.into();
    stream.set_nodelay(true)?;
    log::debug!("[SOCK] tcp connect started -> {}", dst);
    Ok(stream)
}

/// All usable IPv4 interface addresses (loopback included; a train consist
/// bench setup regularly runs both ends on one host).
pub fn interfaces() -> Vec<(String, Ipv4Addr)> {
    match local_ip_address::list_afinet_netifas() {
        Ok(list) => list
            .into_iter()
            .filter_map(|(name, ip)| match ip {
                std::net::IpAddr::V4(v4) => Some((name, v4)),
                std::net::IpAddr::V6(_) => None,
            })
            .collect(),
        Err(e) => {
            log::warn!("[SOCK] interface enumeration failed: {}", e);
            Vec::new()
        }
    }
}

/// Primary interface address, falling back to loopback.
pub fn primary_ip() -> Ipv4Addr {
    match local_ip_address::local_ip() {
        Ok(std::net::IpAddr::V4(v4)) => v4,
        _ => Ipv4Addr::LOCALHOST,
    }
}
