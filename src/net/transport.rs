/* This file is part of proxyscan
 *
 * Copyright (C) 2020-2026 Dyne.org foundation
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use log::debug;
use socket2::{Domain, Socket, Type};

use crate::{Error, Result};

/// Listen backlog for inbound sockets
const LISTEN_BACKLOG: i32 = 1024;

/// Parse a caller-supplied IP literal. Hostnames are rejected, since
/// resolving them would block the reactor thread. Unspecified, multicast
/// and broadcast addresses can never be a connection peer and are
/// rejected as well.
pub fn parse_ip(address: &str) -> Result<IpAddr> {
    let trimmed = address.trim();
    let literal = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')).unwrap_or(trimmed);

    let ip: IpAddr = literal
        .parse()
        .map_err(|_| Error::AddressError(format!("'{}' is not an IP address", address)))?;

    check_ip(ip)
}

/// Reject addresses that can never be a connection peer.
pub fn check_ip(ip: IpAddr) -> Result<IpAddr> {
    if ip.is_unspecified() || ip.is_multicast() || ip == IpAddr::V4(Ipv4Addr::BROADCAST) {
        return Err(Error::AddressError(format!("{} cannot be a connection peer", ip)))
    }

    Ok(ip)
}

/// Reject socket addresses that cannot be dialed.
pub fn validate_peer(addr: &SocketAddr) -> Result<()> {
    if addr.port() == 0 {
        return Err(Error::AddressError(format!("{}: port 0 is not dialable", addr)))
    }

    check_ip(addr.ip()).map(|_| ())
}

/// Outcome of initiating a non-blocking connect.
pub enum Dial {
    /// The handshake is in flight, readiness will report completion
    InProgress(Socket),
    /// The kernel refused synchronously; reported to the handler later
    Failed(io::Error),
}

/// TCP socket factory. Every socket it hands out is already non-blocking.
#[derive(Clone, Debug, Default)]
pub struct TcpDialer {
    /// Local address outbound sockets bind to before connecting
    pub bind_addr: Option<IpAddr>,
    /// IP time-to-live applied to every socket
    pub ttl: Option<u32>,
}

impl TcpDialer {
    pub fn new(bind_addr: Option<IpAddr>, ttl: Option<u32>) -> Self {
        Self { bind_addr, ttl }
    }

    fn create_socket(&self, socket_addr: SocketAddr) -> io::Result<Socket> {
        let domain = if socket_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;

        if socket_addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }

        if let Some(ttl) = self.ttl {
            socket.set_ttl(ttl)?;
        }

        socket.set_keepalive(true)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// Start a non-blocking connect to `socket_addr`. Only socket creation
    /// failures are returned as errors; a synchronous refusal from
    /// `connect(2)` is wrapped in [`Dial::Failed`].
    pub fn dial(&self, socket_addr: SocketAddr) -> io::Result<Dial> {
        let socket = self.create_socket(socket_addr)?;

        if let Some(bind_addr) = self.bind_addr {
            if bind_addr.is_ipv4() == socket_addr.is_ipv4() {
                socket.set_reuse_address(true)?;
                socket.bind(&SocketAddr::new(bind_addr, 0).into())?;
            } else {
                debug!(
                    target: "net::transport",
                    "Not binding to {} for {}: address family mismatch", bind_addr, socket_addr,
                );
            }
        }

        debug!(target: "net::transport", "dialing {}", socket_addr);
        match socket.connect(&socket_addr.into()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Ok(Dial::Failed(err)),
        };

        Ok(Dial::InProgress(socket))
    }

    /// Bind a non-blocking listener on `socket_addr`.
    pub fn listen(&self, socket_addr: SocketAddr) -> io::Result<Socket> {
        let socket = self.create_socket(socket_addr)?;
        socket.set_reuse_address(true)?;
        socket.bind(&socket_addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        debug!(target: "net::transport", "listening on {}", socket_addr);
        Ok(socket)
    }
}
