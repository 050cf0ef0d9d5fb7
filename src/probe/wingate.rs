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

use log::debug;

use super::protocol::{mismatch, Dialect, ProbeProtocol, ProbeState, Step, Verdict};
use crate::net::ReadBuffer;

/// Longest banner read while looking for a gateway prompt
pub const MAX_BANNER: usize = 4096;

/// Prompts printed by an unprotected WinGate telnet gateway.
const MARKERS: [&[u8]; 3] = [
    b"WinGate>",
    b"Enter : <host> [port] :",
    // Still an open gateway, just a busy one
    b"Too many connected users - try again later",
];

/// WinGate probe. Nothing is sent; the gateway announces itself in the
/// banner it prints on connect.
#[derive(Default)]
pub struct WinGateProbe {
    state: ProbeState,
}

impl WinGateProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProbeProtocol for WinGateProbe {
    fn dialect(&self) -> Dialect {
        Dialect::WinGate
    }

    fn state(&self) -> ProbeState {
        self.state
    }

    fn start(&mut self) -> Step {
        self.state = ProbeState::AwaitingConnectReply;
        Step::Wait
    }

    fn on_flushed(&mut self) {}

    fn advance(&mut self, rbuf: &mut ReadBuffer) -> Step {
        if self.state != ProbeState::AwaitingConnectReply {
            return Step::Wait
        }

        let verdict = if let Some(marker) = MARKERS.iter().find(|m| rbuf.find(m).is_some()) {
            debug!(target: "probe::wingate", "found {:?}", String::from_utf8_lossy(marker));
            Verdict::Confirmed
        } else if rbuf.len() > MAX_BANNER {
            mismatch(Dialect::WinGate, format!("no prompt within {} bytes", MAX_BANNER))
        } else {
            return Step::Wait
        };

        rbuf.clear();
        self.state = ProbeState::Done;
        Step::Finish(verdict)
    }
}
