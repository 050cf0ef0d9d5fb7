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
    collections::BTreeMap,
    fmt, io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, error, trace, warn};
use polling::{Event, Events, Poller};
use socket2::Socket;

use super::{
    endpoint::{Direction, Endpoint, EndpointState},
    transport::{parse_ip, validate_peer, Dial, TcpDialer},
};
use crate::{Error, Result};

/// Handle to an endpoint or listener owned by a [`Reactor`].
/// Tokens are never reused for the lifetime of a reactor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

/// Event sink for one endpoint. Every callback runs on the reactor thread
/// with exclusive access to the endpoint. Handlers may queue output, consume
/// input or close the endpoint, but never block.
pub trait Handler {
    /// The outbound connect completed (or an inbound connection was accepted).
    fn on_connect(&mut self, _ep: &mut Endpoint) {}

    /// New bytes were appended to the endpoint's read buffer.
    fn on_readable(&mut self, ep: &mut Endpoint);

    /// Every queued byte has been handed to the kernel.
    fn on_writable(&mut self, _ep: &mut Endpoint) {}

    /// Connect failure, socket error or peer EOF. The endpoint is closed
    /// once this returns.
    fn on_error(&mut self, ep: &mut Endpoint, err: Error);

    /// The idle deadline expired. The endpoint is closed once this returns.
    fn on_timeout(&mut self, ep: &mut Endpoint);

    /// The socket was released. Called exactly once per endpoint.
    fn on_close(&mut self, _ep: &Endpoint) {}
}

/// Supplies handlers for connections accepted by a listener.
pub trait Acceptor {
    /// Return `None` to refuse the connection.
    fn accept(&mut self, peer: SocketAddr) -> Option<Box<dyn Handler>>;
}

/// Interrupts a [`Reactor`] blocked waiting for readiness. Cheap to clone
/// and safe to use from any thread.
#[derive(Clone)]
pub struct Waker {
    poller: Arc<Poller>,
}

impl Waker {
    pub fn wake(&self) -> Result<()> {
        self.poller.notify().map_err(|e| Error::SocketError(e.to_string()))
    }
}

struct Slot {
    endpoint: Endpoint,
    handler: Box<dyn Handler>,
}

struct Listener {
    socket: Socket,
    local_addr: SocketAddr,
    timeout: Option<Duration>,
    acceptor: Box<dyn Acceptor>,
}

fn key(token: Token) -> usize {
    token.0 as usize
}

/// Single-threaded readiness multiplexer over every live endpoint.
pub struct Reactor {
    dialer: TcpDialer,
    endpoints: BTreeMap<Token, Slot>,
    listeners: BTreeMap<Token, Listener>,
    next_token: u64,
    now: Instant,
    poller: Arc<Poller>,
    events: Events,
}

impl Reactor {
    pub fn new(dialer: TcpDialer) -> Result<Self> {
        Ok(Self {
            dialer,
            endpoints: BTreeMap::new(),
            listeners: BTreeMap::new(),
            next_token: 1,
            now: Instant::now(),
            poller: Arc::new(Poller::new()?),
            events: Events::new(),
        })
    }

    /// Monotonic instant sampled at the start of the current iteration.
    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn dialer(&self) -> &TcpDialer {
        &self.dialer
    }

    pub fn waker(&self) -> Waker {
        Waker { poller: self.poller.clone() }
    }

    /// Add `socket` to the poller with no interest yet. Interest is armed
    /// at the start of every iteration.
    fn register(&self, token: Token, socket: &Socket) -> io::Result<()> {
        // SAFETY: every registered socket is deleted from the poller in
        // `deregister` before the reactor drops it.
        unsafe { self.poller.add(socket, Event::none(key(token))) }
    }

    fn deregister(&self, token: Token, socket: Option<&Socket>) {
        let Some(socket) = socket else { return };
        if let Err(e) = self.poller.delete(socket) {
            warn!(target: "net::reactor", "{} poller delete failed: {}", token, e);
        }
    }

    /// Release an endpoint removed from the table and tell its handler.
    fn release(&self, token: Token, mut slot: Slot, now: Instant) {
        self.deregister(token, slot.endpoint.socket());
        slot.endpoint.release(now);
        slot.handler.on_close(&slot.endpoint);
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Start a non-blocking connect to `address:port`. A malformed address
    /// fails right away; every other failure is delivered to `handler`
    /// from a later [`Reactor::run_once`].
    pub fn open(
        &mut self,
        address: &str,
        port: u16,
        timeout: Option<Duration>,
        handler: Box<dyn Handler>,
    ) -> Result<Token> {
        let ip = parse_ip(address)?;
        self.open_addr(SocketAddr::new(ip, port), timeout, handler)
    }

    pub fn open_addr(
        &mut self,
        addr: SocketAddr,
        timeout: Option<Duration>,
        handler: Box<dyn Handler>,
    ) -> Result<Token> {
        validate_peer(&addr)?;

        let token = self.alloc_token();
        let now = Instant::now();

        let endpoint = match self.dialer.dial(addr) {
            Ok(Dial::InProgress(socket)) => match self.register(token, &socket) {
                Ok(()) => Endpoint::new(token, Some(socket), Direction::Outbound, addr, timeout, now),
                Err(e) => {
                    warn!(target: "net::reactor", "{} cannot watch socket for {}: {}", token, addr, e);
                    Endpoint::failed(token, addr, Error::SocketError(e.to_string()), now)
                }
            },
            Ok(Dial::Failed(e)) => {
                debug!(target: "net::reactor", "{} connect to {} refused: {}", token, addr, e);
                Endpoint::failed(token, addr, Error::ConnectFailed(e.to_string()), now)
            }
            Err(e) => {
                warn!(target: "net::reactor", "{} socket for {} failed: {}", token, addr, e);
                Endpoint::failed(token, addr, Error::SocketError(e.to_string()), now)
            }
        };

        trace!(target: "net::reactor", "{} opened to {}", token, addr);
        self.endpoints.insert(token, Slot { endpoint, handler });
        Ok(token)
    }

    /// Bind a listener. Accepted connections become inbound endpoints
    /// with the given idle timeout and a handler from `acceptor`.
    pub fn listen(
        &mut self,
        addr: SocketAddr,
        timeout: Option<Duration>,
        acceptor: Box<dyn Acceptor>,
    ) -> Result<Token> {
        let socket = self
            .dialer
            .listen(addr)
            .map_err(|e| Error::BindFailed(format!("{}: {}", addr, e)))?;

        let local_addr = socket.local_addr()?.as_socket().unwrap_or(addr);
        let token = self.alloc_token();
        self.register(token, &socket)?;
        debug!(target: "net::reactor", "{} listening on {}", token, local_addr);
        self.listeners.insert(token, Listener { socket, local_addr, timeout, acceptor });
        Ok(token)
    }

    pub fn listener_addr(&self, token: Token) -> Option<SocketAddr> {
        self.listeners.get(&token).map(|l| l.local_addr)
    }

    /// Replace every callback of an endpoint at once.
    pub fn register_handler(&mut self, token: Token, handler: Box<dyn Handler>) -> Result<()> {
        let slot = self.endpoints.get_mut(&token).ok_or(Error::UnknownEndpoint)?;
        slot.handler = handler;
        Ok(())
    }

    pub fn send(&mut self, token: Token, data: &[u8]) -> Result<()> {
        let slot = self.endpoints.get_mut(&token).ok_or(Error::EndpointClosed)?;
        slot.endpoint.send(data)
    }

    pub fn endpoint(&self, token: Token) -> Option<&Endpoint> {
        self.endpoints.get(&token).map(|s| &s.endpoint)
    }

    pub fn endpoint_mut(&mut self, token: Token) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(&token).map(|s| &mut s.endpoint)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.endpoints.contains_key(&token) || self.listeners.contains_key(&token)
    }

    /// Number of live endpoints, listeners excluded.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Close an endpoint or listener from outside of dispatch. The socket is
    /// released and `on_close` invoked before this returns. Unknown or
    /// already closed tokens are ignored.
    pub fn close(&mut self, token: Token) {
        if let Some(listener) = self.listeners.remove(&token) {
            self.deregister(token, Some(&listener.socket));
            debug!(target: "net::reactor", "{} listener on {} closed", token, listener.local_addr);
            return
        }

        if let Some(mut slot) = self.endpoints.remove(&token) {
            slot.endpoint.close();
            self.release(token, slot, Instant::now());
        }
    }

    /// Close everything.
    pub fn shutdown(&mut self) {
        debug!(target: "net::reactor", "Shutting down {} endpoints", self.endpoints.len());
        let tokens: Vec<Token> =
            self.listeners.keys().chain(self.endpoints.keys()).copied().collect();
        for token in tokens {
            self.close(token);
        }
    }

    /// Earliest idle deadline across all endpoints.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.endpoints.values().filter_map(|s| s.endpoint.deadline()).min()
    }

    fn wait_timeout(&self, extra_deadline: Option<Instant>) -> Option<Duration> {
        if self.endpoints.values().any(|s| s.endpoint.has_pending_error()) {
            return Some(Duration::ZERO)
        }

        let deadline = match (self.next_deadline(), extra_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Re-arm the interest of every listener and open endpoint. Sockets
    /// are registered in oneshot mode, so each delivered event disarms
    /// its socket until this runs again.
    fn arm(&self) {
        for (token, listener) in self.listeners.iter() {
            if let Err(e) = self.poller.modify(&listener.socket, Event::readable(key(*token))) {
                warn!(target: "net::reactor", "{} cannot arm listener: {}", token, e);
            }
        }

        for (token, slot) in self.endpoints.iter() {
            let Some(socket) = slot.endpoint.socket() else { continue };
            let (readable, writable) = slot.endpoint.interest();
            if let Err(e) = self.poller.modify(socket, Event::new(key(*token), readable, writable)) {
                warn!(target: "net::reactor", "{} cannot arm endpoint: {}", token, e);
            }
        }
    }

    /// One multiplexing pass: wait for readiness (bounded by the nearest
    /// endpoint deadline and `extra_deadline`), dispatch events, fire
    /// expired timeouts and reap closed endpoints.
    pub fn run_once(&mut self, extra_deadline: Option<Instant>) -> Result<()> {
        let timeout = self.wait_timeout(extra_deadline);
        self.arm();

        self.events.clear();
        if let Err(e) = self.poller.wait(&mut self.events, timeout) {
            error!(target: "net::reactor", "poller wait failed: {}", e);
            return Err(Error::SocketError(e.to_string()))
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|ev| (Token(ev.key as u64), ev.readable, ev.writable))
            .collect();

        self.now = Instant::now();

        self.dispatch_pending_errors();

        for (token, readable, writable) in ready {
            if self.listeners.contains_key(&token) {
                self.accept(token);
            } else {
                self.dispatch(token, readable, writable);
            }
        }

        self.fire_timeouts();
        self.reap();
        Ok(())
    }

    fn dispatch_pending_errors(&mut self) {
        for slot in self.endpoints.values_mut() {
            let Slot { endpoint: ep, handler } = slot;
            if let Some(err) = ep.take_pending_error() {
                handler.on_error(ep, err);
                ep.abort();
            }
        }
    }

    fn accept(&mut self, token: Token) {
        let now = self.now;
        let Some(listener) = self.listeners.get_mut(&token) else { return };

        let mut accepted = vec![];
        loop {
            let (socket, peer) = match listener.socket.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(target: "net::reactor", "{} accept failed: {}", token, e);
                    break
                }
            };

            let Some(peer) = peer.as_socket() else { continue };
            if let Err(e) = socket.set_nonblocking(true) {
                warn!(target: "net::reactor", "{} set_nonblocking failed: {}", token, e);
                continue
            }

            match listener.acceptor.accept(peer) {
                Some(handler) => accepted.push((socket, peer, handler, listener.timeout)),
                None => debug!(target: "net::reactor", "{} refused {}", token, peer),
            }
        }

        for (socket, peer, handler, timeout) in accepted {
            let token = self.alloc_token();
            if let Err(e) = self.register(token, &socket) {
                warn!(target: "net::reactor", "{} cannot watch socket from {}: {}", token, peer, e);
                continue
            }

            let endpoint = Endpoint::new(token, Some(socket), Direction::Inbound, peer, timeout, now);
            debug!(target: "net::reactor", "{} accepted from {}", token, peer);

            let mut slot = Slot { endpoint, handler };
            slot.handler.on_connect(&mut slot.endpoint);
            Self::pump_writes(&mut slot, now);
            self.endpoints.insert(token, slot);
        }
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        let now = self.now;
        let Some(slot) = self.endpoints.get_mut(&token) else { return };
        if !slot.endpoint.is_open() {
            return
        }

        if slot.endpoint.state() == EndpointState::Connecting {
            // Errors and hangups surface as both readable and writable
            if !writable && !readable {
                return
            }

            match slot.endpoint.finish_connect(now) {
                Ok(()) => slot.handler.on_connect(&mut slot.endpoint),
                Err(e) => {
                    debug!(target: "net::reactor", "{} {}", token, e);
                    slot.handler.on_error(&mut slot.endpoint, e);
                    slot.endpoint.abort();
                    return
                }
            }
        } else if readable {
            match slot.endpoint.fill(now) {
                Ok(fill) => {
                    if fill.read > 0 {
                        slot.handler.on_readable(&mut slot.endpoint);
                    }

                    if fill.eof && slot.endpoint.is_open() {
                        debug!(target: "net::reactor", "{} peer closed", token);
                        slot.handler.on_error(&mut slot.endpoint, Error::PeerClosed);
                        slot.endpoint.abort();
                    }
                }
                Err(e) => {
                    debug!(target: "net::reactor", "{} read failed: {}", token, e);
                    slot.handler.on_error(&mut slot.endpoint, Error::SocketError(e.to_string()));
                    slot.endpoint.abort();
                }
            }
        }

        Self::pump_writes(slot, now);
    }

    /// Flush queued output. `on_writable` fires once the buffer drains.
    fn pump_writes(slot: &mut Slot, now: Instant) {
        let ep = &mut slot.endpoint;
        if ep.state() != EndpointState::Connected || ep.pending_writes() == 0 {
            return
        }

        match ep.flush(now) {
            Ok(true) => slot.handler.on_writable(ep),
            Ok(false) => {}
            Err(e) => {
                debug!(target: "net::reactor", "{} write failed: {}", ep.token(), e);
                slot.handler.on_error(ep, Error::SocketError(e.to_string()));
                ep.abort();
            }
        }
    }

    fn fire_timeouts(&mut self) {
        let now = self.now;
        for slot in self.endpoints.values_mut() {
            let Some(deadline) = slot.endpoint.deadline() else { continue };
            if deadline > now {
                continue
            }

            debug!(target: "net::reactor", "{} to {} timed out", slot.endpoint.token(), slot.endpoint.peer_addr());
            slot.handler.on_timeout(&mut slot.endpoint);
            slot.endpoint.abort();
        }
    }

    fn reap(&mut self) {
        let now = self.now;
        let closed: Vec<Token> =
            self.endpoints.iter().filter(|(_, s)| !s.endpoint.is_open()).map(|(t, _)| *t).collect();

        for token in closed {
            if let Some(slot) = self.endpoints.remove(&token) {
                self.release(token, slot, now);
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
