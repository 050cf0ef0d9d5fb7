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

use std::net::SocketAddr;

use log::debug;

use super::protocol::{mismatch, Dialect, ProbeProtocol, ProbeState, Step, Verdict};
use crate::{net::ReadBuffer, Error};

/// Largest response head accepted before giving up on the peer
pub const MAX_HTTP_HEAD: usize = 4096;
const MAX_HEADERS: usize = 64;
/// Reason phrase of a `200` that actually opened a tunnel
const TUNNEL_REASON: &str = "Connection established";

/// HTTP `CONNECT` probe.
pub struct HttpProbe {
    state: ProbeState,
    dest: SocketAddr,
}

impl HttpProbe {
    pub fn new(dest: SocketAddr) -> Self {
        Self { state: ProbeState::Start, dest }
    }

    fn request(&self) -> Vec<u8> {
        // SocketAddr brackets IPv6 hosts already
        format!("CONNECT {} HTTP/1.0\r\n\r\n", self.dest).into_bytes()
    }

    fn parse_head(rbuf: &ReadBuffer) -> Option<Verdict> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);

        match response.parse(rbuf.as_slice()) {
            Ok(httparse::Status::Complete(_)) => {
                let code = response.code.unwrap_or(0);
                let reason = response.reason.unwrap_or("");
                if code == 200 && reason.trim().eq_ignore_ascii_case(TUNNEL_REASON) {
                    Some(Verdict::Confirmed)
                } else {
                    Some(Verdict::Denied(Error::RelayDenied(format!("HTTP {} {}", code, reason))))
                }
            }
            Ok(httparse::Status::Partial) if rbuf.len() > MAX_HTTP_HEAD => {
                Some(mismatch(Dialect::Http, format!("response head over {} bytes", MAX_HTTP_HEAD)))
            }
            Ok(httparse::Status::Partial) => None,
            Err(e) => Some(mismatch(Dialect::Http, e)),
        }
    }
}

impl ProbeProtocol for HttpProbe {
    fn dialect(&self) -> Dialect {
        Dialect::Http
    }

    fn state(&self) -> ProbeState {
        self.state
    }

    fn start(&mut self) -> Step {
        self.state = ProbeState::SendingConnectRequest;
        Step::Send(self.request())
    }

    fn on_flushed(&mut self) {
        self.state = self.state.flushed();
    }

    fn advance(&mut self, rbuf: &mut ReadBuffer) -> Step {
        if !matches!(
            self.state,
            ProbeState::SendingConnectRequest | ProbeState::AwaitingConnectReply
        ) {
            return Step::Wait
        }

        let Some(verdict) = Self::parse_head(rbuf) else { return Step::Wait };
        debug!(target: "probe::http", "CONNECT {}: {}", self.dest, verdict);
        rbuf.clear();
        self.state = ProbeState::Done;
        Step::Finish(verdict)
    }
}
