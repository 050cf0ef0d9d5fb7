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
use crate::{net::ReadBuffer, Error, Result};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_IPV6: u8 = 0x04;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

/// Human readable RFC 1928 reply code.
fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply",
    }
}

/// SOCKS5 CONNECT probe: method negotiation, optional RFC 1929
/// username/password authentication, then the connect request.
pub struct Socks5Probe {
    state: ProbeState,
    dest: SocketAddr,
    credentials: Option<(String, String)>,
}

impl Socks5Probe {
    pub fn new(dest: SocketAddr, credentials: Option<(String, String)>) -> Result<Self> {
        if let Some((user, pass)) = &credentials {
            if user.is_empty() || user.len() > 255 || pass.len() > 255 {
                return Err(Error::ConfigInvalid(
                    "SOCKS5 username must be 1-255 bytes, password at most 255".into(),
                ))
            }
        }

        Ok(Self { state: ProbeState::Start, dest, credentials })
    }

    fn greeting(&self) -> Vec<u8> {
        match self.credentials {
            Some(_) => vec![SOCKS5_VERSION, 0x02, METHOD_NO_AUTH, METHOD_USERPASS],
            None => vec![SOCKS5_VERSION, 0x01, METHOD_NO_AUTH],
        }
    }

    fn auth_request(&self) -> Vec<u8> {
        let (user, pass) = match &self.credentials {
            Some((u, p)) => (u.as_bytes(), p.as_bytes()),
            None => (&[][..], &[][..]),
        };

        let mut req = Vec::with_capacity(3 + user.len() + pass.len());
        req.push(AUTH_VERSION);
        req.push(user.len() as u8);
        req.extend_from_slice(user);
        req.push(pass.len() as u8);
        req.extend_from_slice(pass);
        req
    }

    fn connect_request(&self) -> Vec<u8> {
        let mut req = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
        match self.dest {
            SocketAddr::V4(a) => {
                req.push(ATYP_IPV4);
                req.extend_from_slice(&a.ip().octets());
            }
            SocketAddr::V6(a) => {
                req.push(ATYP_IPV6);
                req.extend_from_slice(&a.ip().octets());
            }
        }
        req.extend_from_slice(&self.dest.port().to_be_bytes());
        req
    }

    fn send_connect(&mut self) -> Step {
        self.state = ProbeState::SendingConnectRequest;
        Step::Send(self.connect_request())
    }

    fn finish(&mut self, verdict: Verdict) -> Step {
        debug!(target: "probe::socks5", "{:?}: {}", self.state, verdict);
        self.state = ProbeState::Done;
        Step::Finish(verdict)
    }

    fn method_reply(&mut self, ver: u8, method: u8) -> Step {
        if ver != SOCKS5_VERSION {
            return self.finish(mismatch(Dialect::Socks5, format!("method reply version {:#04x}", ver)))
        }

        match method {
            METHOD_NO_AUTH => self.send_connect(),
            METHOD_USERPASS if self.credentials.is_some() => {
                self.state = ProbeState::SendingAuth;
                Step::Send(self.auth_request())
            }
            METHOD_NONE_ACCEPTABLE => {
                self.finish(Verdict::Denied(Error::RelayDenied("no acceptable auth method".into())))
            }
            other => self.finish(mismatch(Dialect::Socks5, format!("unoffered method {:#04x}", other))),
        }
    }

    fn connect_reply(&mut self, ver: u8, rep: u8) -> Step {
        if ver != SOCKS5_VERSION {
            return self.finish(mismatch(Dialect::Socks5, format!("reply version {:#04x}", ver)))
        }

        match rep {
            0x00 => self.finish(Verdict::Confirmed),
            0x01..=0x08 => {
                self.finish(Verdict::Denied(Error::RelayDenied(reply_message(rep).to_string())))
            }
            other => self.finish(mismatch(Dialect::Socks5, format!("reply code {:#04x}", other))),
        }
    }
}

impl ProbeProtocol for Socks5Probe {
    fn dialect(&self) -> Dialect {
        Dialect::Socks5
    }

    fn state(&self) -> ProbeState {
        self.state
    }

    fn start(&mut self) -> Step {
        self.state = ProbeState::SendingHandshake;
        Step::Send(self.greeting())
    }

    fn on_flushed(&mut self) {
        self.state = self.state.flushed();
    }

    fn advance(&mut self, rbuf: &mut ReadBuffer) -> Step {
        if matches!(self.state, ProbeState::Start | ProbeState::Done) {
            return Step::Wait
        }

        // Every reply this probe waits for starts with a 2 byte header
        let Some(reply) = rbuf.take_exact(2) else { return Step::Wait };

        match self.state {
            ProbeState::SendingHandshake | ProbeState::AwaitingHandshakeReply => {
                self.method_reply(reply[0], reply[1])
            }
            ProbeState::SendingAuth | ProbeState::AwaitingAuthReply => {
                if reply == [AUTH_VERSION, 0x00] {
                    self.send_connect()
                } else {
                    self.finish(Verdict::Denied(Error::RelayDenied("authentication rejected".into())))
                }
            }
            _ => self.connect_reply(reply[0], reply[1]),
        }
    }
}
