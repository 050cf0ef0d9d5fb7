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
    io::{self, Read},
    net::{Shutdown, SocketAddr},
    time::{Duration, Instant},
};

use log::{debug, trace};
use socket2::Socket;

use super::{
    buffer::{ReadBuffer, WriteBuffer},
    reactor::Token,
};
use crate::{Error, Result};

/// Size of the stack chunk used for every `read(2)`
const READ_CHUNK: usize = 4096;
/// Upper bound of bytes pulled from one socket per reactor iteration, so a
/// chatty peer cannot starve the others
const MAX_READ_PER_TURN: usize = 64 * 1024;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Accepted from one of our listeners
    Inbound,
    /// Dialed by us
    Outbound,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum WriteHalf {
    Open,
    /// Shut down once the write buffer drains
    ShutdownPending,
    Shutdown,
}

/// Bytes pulled out of the socket during one readiness event.
pub(crate) struct Fill {
    pub read: usize,
    pub eof: bool,
}

/// One network socket, owned by the reactor and lent to its handler.
pub struct Endpoint {
    token: Token,
    socket: Option<Socket>,
    direction: Direction,
    state: EndpointState,
    peer_addr: SocketAddr,
    read_buf: ReadBuffer,
    write_buf: WriteBuffer,
    write_half: WriteHalf,
    last_activity: Instant,
    timeout: Option<Duration>,
    /// Set when the pending output must be discarded on release
    aborted: bool,
    /// Connect failure reported synchronously by the kernel
    pending_error: Option<Error>,
}

impl Endpoint {
    pub(crate) fn new(
        token: Token,
        socket: Option<Socket>,
        direction: Direction,
        peer_addr: SocketAddr,
        timeout: Option<Duration>,
        now: Instant,
    ) -> Self {
        let state = match direction {
            Direction::Outbound => EndpointState::Connecting,
            Direction::Inbound => EndpointState::Connected,
        };

        Self {
            token,
            socket,
            direction,
            state,
            peer_addr,
            read_buf: ReadBuffer::new(),
            write_buf: WriteBuffer::new(),
            write_half: WriteHalf::Open,
            last_activity: now,
            timeout,
            aborted: false,
            pending_error: None,
        }
    }

    pub(crate) fn failed(token: Token, peer_addr: SocketAddr, err: Error, now: Instant) -> Self {
        let mut ep = Self::new(token, None, Direction::Outbound, peer_addr, None, now);
        ep.pending_error = Some(err);
        ep
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// `true` while connecting or connected.
    pub fn is_open(&self) -> bool {
        matches!(self.state, EndpointState::Connecting | EndpointState::Connected)
    }

    /// Queue `data` for sending. Never blocks; the reactor flushes the
    /// queue as the socket becomes writable.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_open() || self.write_half != WriteHalf::Open {
            return Err(Error::EndpointClosed)
        }

        self.write_buf.queue(data);
        Ok(())
    }

    /// Received bytes not yet consumed by the handler.
    pub fn read_buf(&mut self) -> &mut ReadBuffer {
        &mut self.read_buf
    }

    pub fn pending_writes(&self) -> usize {
        self.write_buf.len()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Change the idle timeout, measured from the last socket activity.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Instant at which the reactor fires `on_timeout` for this endpoint.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.is_open() {
            return None
        }

        self.timeout.map(|t| self.last_activity + t)
    }

    /// Begin closing. Pending output gets one best-effort flush at the end
    /// of the reactor iteration. Calling this again has no effect.
    pub fn close(&mut self) {
        if self.is_open() {
            trace!(target: "net::endpoint", "{} closing", self.token);
            self.state = EndpointState::Closing;
        }
    }

    /// Half-close: send FIN once every queued byte has been written. Reads
    /// keep working until the peer closes its side.
    pub fn shutdown_write(&mut self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::EndpointClosed)
        }

        if self.write_half == WriteHalf::Open {
            self.write_half = WriteHalf::ShutdownPending;
        }

        if self.state == EndpointState::Connected && self.write_buf.is_empty() {
            self.finish_write_shutdown();
        }

        Ok(())
    }

    /// Close and discard any pending output. Used after socket errors.
    pub(crate) fn abort(&mut self) {
        self.aborted = true;
        self.close();
    }

    pub(crate) fn take_pending_error(&mut self) -> Option<Error> {
        self.pending_error.take()
    }

    pub(crate) fn has_pending_error(&self) -> bool {
        self.pending_error.is_some()
    }

    pub(crate) fn socket(&self) -> Option<&Socket> {
        self.socket.as_ref()
    }

    /// Readiness this endpoint is waiting for, as `(readable, writable)`.
    pub(crate) fn interest(&self) -> (bool, bool) {
        match self.state {
            EndpointState::Connecting => (false, true),
            EndpointState::Connected => (true, !self.write_buf.is_empty()),
            EndpointState::Closing | EndpointState::Closed => (false, false),
        }
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Resolve an in-flight connect after the socket reported readiness.
    pub(crate) fn finish_connect(&mut self, now: Instant) -> Result<()> {
        let Some(socket) = self.socket.as_ref() else { return Err(Error::EndpointClosed) };

        match socket.take_error() {
            Ok(None) => {}
            Ok(Some(err)) | Err(err) => return Err(Error::ConnectFailed(err.to_string())),
        }

        // A readiness event without SO_ERROR can still be a failed handshake
        // on some kernels; a connected socket always has a peer.
        if let Err(err) = socket.peer_addr() {
            return Err(Error::ConnectFailed(err.to_string()))
        }

        self.state = EndpointState::Connected;
        self.touch(now);
        debug!(target: "net::endpoint", "{} connected to {}", self.token, self.peer_addr);
        Ok(())
    }

    /// Drain the socket into the read buffer until it would block.
    pub(crate) fn fill(&mut self, now: Instant) -> io::Result<Fill> {
        let Some(socket) = self.socket.as_mut() else {
            return Ok(Fill { read: 0, eof: true })
        };

        let mut chunk = [0u8; READ_CHUNK];
        let mut fill = Fill { read: 0, eof: false };

        while fill.read < MAX_READ_PER_TURN {
            match socket.read(&mut chunk) {
                Ok(0) => {
                    fill.eof = true;
                    break
                }
                Ok(n) => {
                    self.read_buf.extend(&chunk[..n]);
                    fill.read += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        if fill.read > 0 {
            trace!(target: "net::endpoint", "{} read {} bytes", self.token, fill.read);
            self.touch(now);
        }

        Ok(fill)
    }

    /// Write as much queued output as the socket accepts. Returns `true`
    /// once the write buffer is empty.
    pub(crate) fn flush(&mut self, now: Instant) -> io::Result<bool> {
        let Some(socket) = self.socket.as_ref() else { return Ok(self.write_buf.is_empty()) };

        let mut written = 0;
        while !self.write_buf.is_empty() {
            match socket.send_with_flags(self.write_buf.pending(), SEND_FLAGS) {
                Ok(0) => break,
                Ok(n) => {
                    self.write_buf.advance(n);
                    written += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        if written > 0 {
            trace!(target: "net::endpoint", "{} wrote {} bytes", self.token, written);
            self.touch(now);
        }

        let drained = self.write_buf.is_empty();
        if drained && self.write_half == WriteHalf::ShutdownPending {
            self.finish_write_shutdown();
        }

        Ok(drained)
    }

    fn finish_write_shutdown(&mut self) {
        if let Some(socket) = self.socket.as_ref() {
            if let Err(e) = socket.shutdown(Shutdown::Write) {
                debug!(target: "net::endpoint", "{} shutdown(write) failed: {}", self.token, e);
            }
        }
        self.write_half = WriteHalf::Shutdown;
    }

    /// Final step of a close: one non-blocking flush attempt unless the
    /// endpoint was aborted, then the socket is released.
    pub(crate) fn release(&mut self, now: Instant) {
        if self.state == EndpointState::Closed {
            return
        }

        if !self.aborted && self.state == EndpointState::Closing && !self.write_buf.is_empty() {
            if let Err(e) = self.flush(now) {
                debug!(target: "net::endpoint", "{} final flush failed: {}", self.token, e);
            }
        }

        if let Some(socket) = self.socket.take() {
            if !self.aborted && self.write_half != WriteHalf::Shutdown {
                let _ = socket.shutdown(Shutdown::Write);
            }
            drop(socket);
        }

        self.write_buf.clear();
        self.state = EndpointState::Closed;
        debug!(target: "net::endpoint", "{} to {} closed", self.token, self.peer_addr);
    }
}
