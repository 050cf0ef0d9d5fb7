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

use std::net::{SocketAddr, SocketAddrV4};

use log::debug;

use super::protocol::{mismatch, Dialect, ProbeProtocol, ProbeState, Step, Verdict};
use crate::{net::ReadBuffer, Error, Result};

const SOCKS4_VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;

const REQUEST_GRANTED: u8 = 90;
const REQUEST_REJECTED: u8 = 91;
const NO_IDENTD: u8 = 92;
const IDENTD_MISMATCH: u8 = 93;

/// SOCKS4 CONNECT probe. There is no handshake: the request goes out as
/// soon as the connection is up and the verdict is decided on the first
/// two reply bytes.
pub struct Socks4Probe {
    state: ProbeState,
    dest: SocketAddrV4,
    userid: Vec<u8>,
}

impl Socks4Probe {
    pub fn new(dest: SocketAddr, userid: &str) -> Result<Self> {
        let SocketAddr::V4(dest) = dest else {
            return Err(Error::AddressError(format!("SOCKS4 cannot reach {}", dest)))
        };

        if userid.as_bytes().contains(&0) {
            return Err(Error::ConfigInvalid("SOCKS4 user id contains NUL".into()))
        }

        Ok(Self { state: ProbeState::Start, dest, userid: userid.as_bytes().to_vec() })
    }

    fn request(&self) -> Vec<u8> {
        let mut req = Vec::with_capacity(9 + self.userid.len());
        req.push(SOCKS4_VERSION);
        req.push(CMD_CONNECT);
        req.extend_from_slice(&self.dest.port().to_be_bytes());
        req.extend_from_slice(&self.dest.ip().octets());
        req.extend_from_slice(&self.userid);
        req.push(0);
        req
    }
}

/// Classify the version and status bytes of a SOCKS4 reply.
pub fn decide_reply(vn: u8, cd: u8) -> Verdict {
    if vn != 0 && vn != SOCKS4_VERSION {
        return mismatch(Dialect::Socks4, format!("reply version {:#04x}", vn))
    }

    match cd {
        REQUEST_GRANTED => Verdict::Confirmed,
        REQUEST_REJECTED => Verdict::Denied(Error::RelayDenied("request rejected or failed".into())),
        NO_IDENTD => Verdict::Denied(Error::RelayDenied("cannot reach client identd".into())),
        IDENTD_MISMATCH => Verdict::Denied(Error::RelayDenied("identd user id mismatch".into())),
        other => mismatch(Dialect::Socks4, format!("reply status {}", other)),
    }
}

impl ProbeProtocol for Socks4Probe {
    fn dialect(&self) -> Dialect {
        Dialect::Socks4
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

        let Some(reply) = rbuf.take_exact(2) else { return Step::Wait };
        self.state = ProbeState::Done;

        let verdict = decide_reply(reply[0], reply[1]);
        debug!(target: "probe::socks4", "reply {:02x} {:02x}: {}", reply[0], reply[1], verdict);
        Step::Finish(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> Socks4Probe {
        Socks4Probe::new("192.0.2.10:6667".parse().unwrap(), "scan").unwrap()
    }

    #[test]
    fn connect_request_layout() {
        let mut p = probe();
        assert_eq!(p.state(), ProbeState::Start);
        let Step::Send(req) = p.start() else { panic!("no request") };
        assert_eq!(req, [0x04, 0x01, 0x1a, 0x0b, 192, 0, 2, 10, b's', b'c', b'a', b'n', 0x00]);
        assert_eq!(p.state(), ProbeState::SendingConnectRequest);

        p.on_flushed();
        assert_eq!(p.state(), ProbeState::AwaitingConnectReply);
    }

    #[test]
    fn split_reply_waits_for_status() {
        let mut p = probe();
        p.start();
        p.on_flushed();

        let mut rbuf = ReadBuffer::new();
        rbuf.extend(&[0x00]);
        assert_eq!(p.advance(&mut rbuf), Step::Wait);
        assert_eq!(p.state(), ProbeState::AwaitingConnectReply);

        rbuf.extend(&[0x5a, 0x1a, 0x0b, 0, 0, 0, 0]);
        assert_eq!(p.advance(&mut rbuf), Step::Finish(Verdict::Confirmed));
        assert_eq!(p.state(), ProbeState::Done);
    }

    #[test]
    fn only_granted_status_confirms() {
        for vn in 0..=255u8 {
            for cd in 0..=255u8 {
                let confirmed = decide_reply(vn, cd).is_confirmed();
                assert_eq!(confirmed, (vn == 0 || vn == 4) && cd == 90, "{} {}", vn, cd);
            }
        }

        assert!(matches!(decide_reply(0, 91), Verdict::Denied(Error::RelayDenied(_))));
        assert!(matches!(decide_reply(4, 93), Verdict::Denied(Error::RelayDenied(_))));
        assert!(matches!(decide_reply(5, 90), Verdict::Denied(Error::ProtocolMismatch(_))));
        assert!(matches!(decide_reply(0, 0), Verdict::Denied(Error::ProtocolMismatch(_))));
    }

    #[test]
    fn ipv6_destination_rejected() {
        assert!(matches!(
            Socks4Probe::new("[2001:db8::1]:6667".parse().unwrap(), ""),
            Err(Error::AddressError(_))
        ));
    }
}
