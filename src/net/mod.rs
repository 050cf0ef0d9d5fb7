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

/// Read and write buffers attached to every endpoint. The read buffer
/// implements record extraction for both line-oriented and fixed-length
/// binary grammars, leaving any partial tail buffered until more bytes
/// arrive.
pub mod buffer;

/// A single non-blocking network socket together with its connection
/// state, buffers and activity bookkeeping. Endpoints are owned by the
/// reactor and lent to their registered handler during dispatch.
pub mod endpoint;

/// The single-threaded I/O multiplexer. Owns the table of live endpoints
/// and listeners, waits for socket readiness on a `polling::Poller`, and
/// dispatches connect, readable, writable, error and timeout events to
/// each endpoint's handler.
///
/// Handlers may close their endpoint from inside a callback. The close
/// takes effect at the end of the current iteration, never re-entrantly.
pub mod reactor;

/// TCP socket creation for outbound dials and inbound listeners, along with
/// address validation for caller-supplied input.
pub mod transport;


pub use buffer::{ReadBuffer, WriteBuffer};
pub use endpoint::{Direction, Endpoint, EndpointState};
pub use reactor::{Acceptor, Handler, Reactor, Token, Waker};
pub use transport::{check_ip, parse_ip, TcpDialer};
