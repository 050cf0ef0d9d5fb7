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

use std::{fmt, str::FromStr};

use super::{
    http::HttpProbe, settings::Settings, socks4::Socks4Probe, socks5::Socks5Probe,
    wingate::WinGateProbe,
};
use crate::{net::ReadBuffer, Error, Result};

/// Relay protocol spoken by a probe.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dialect {
    Socks4,
    Socks5,
    Http,
    WinGate,
}

impl Dialect {
    pub const ALL: [Dialect; 4] = [Dialect::Socks4, Dialect::Socks5, Dialect::Http, Dialect::WinGate];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
            Self::Http => "http",
            Self::WinGate => "wingate",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .find(|d| d.name() == lower)
            .copied()
            .ok_or_else(|| Error::UnknownDialect(s.to_string()))
    }
}

/// One `(dialect, port)` pair tried against every candidate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScanTarget {
    pub dialect: Dialect,
    pub port: u16,
}

impl ScanTarget {
    pub fn new(dialect: Dialect, port: u16) -> Self {
        Self { dialect, port }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dialect, self.port)
    }
}

impl FromStr for ScanTarget {
    type Err = Error;

    /// Parses `dialect:port`, e.g. `socks5:1080`.
    fn from_str(s: &str) -> Result<Self> {
        let Some((dialect, port)) = s.trim().split_once(':') else {
            return Err(Error::InvalidScanTarget(format!("'{}' is not dialect:port", s)))
        };

        let dialect = dialect.parse()?;
        let port = match port.parse::<u16>() {
            Ok(p) if p != 0 => p,
            _ => return Err(Error::InvalidScanTarget(format!("'{}': bad port", s))),
        };

        Ok(Self { dialect, port })
    }
}

impl<'de> serde::Deserialize<'de> for ScanTarget {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The scan table used when a caller does not pass its own targets.
pub fn default_scan_targets() -> Vec<ScanTarget> {
    vec![
        ScanTarget::new(Dialect::WinGate, 23),
        ScanTarget::new(Dialect::Socks4, 1080),
        ScanTarget::new(Dialect::Socks5, 1080),
        ScanTarget::new(Dialect::Http, 80),
        ScanTarget::new(Dialect::Http, 1080),
        ScanTarget::new(Dialect::Http, 3128),
        ScanTarget::new(Dialect::Http, 8080),
    ]
}

/// Result of one probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    /// The peer relayed our connect request: an open proxy
    Confirmed,
    /// The peer answered, timed out or hung up without relaying
    Denied(Error),
    /// The connection could not be established or broke down
    Failed(Error),
    /// A sibling probe settled the job first
    Cancelled,
}

impl Verdict {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Denied(e) if e.is_timeout())
    }

    /// A definitive answer from a live peer, as opposed to a timeout.
    pub fn is_definitive_denial(&self) -> bool {
        matches!(self, Self::Denied(e) if !e.is_timeout())
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Denied(e) => write!(f, "denied ({})", e),
            Self::Failed(e) => write!(f, "failed ({})", e),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ProbeState {
    #[default]
    Start,
    SendingHandshake,
    AwaitingHandshakeReply,
    SendingAuth,
    AwaitingAuthReply,
    SendingConnectRequest,
    AwaitingConnectReply,
    Done,
}

impl ProbeState {
    /// State reached once the request queued in this state hit the wire.
    pub fn flushed(self) -> Self {
        match self {
            Self::SendingHandshake => Self::AwaitingHandshakeReply,
            Self::SendingAuth => Self::AwaitingAuthReply,
            Self::SendingConnectRequest => Self::AwaitingConnectReply,
            other => other,
        }
    }
}

/// What the socket side should do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Send(Vec<u8>),
    Wait,
    Finish(Verdict),
}

/// Socket-free grammar of one relay dialect. The driver feeds it the
/// endpoint's read buffer; incomplete records must leave the buffer alone
/// and return [`Step::Wait`].
pub trait ProbeProtocol {
    fn dialect(&self) -> Dialect;

    fn state(&self) -> ProbeState;

    /// Called once the connection is up.
    fn start(&mut self) -> Step;

    /// Every queued byte was written.
    fn on_flushed(&mut self);

    /// React to bytes in `rbuf`.
    fn advance(&mut self, rbuf: &mut ReadBuffer) -> Step;

    /// The peer closed before a verdict was reached.
    fn on_peer_closed(&mut self) -> Verdict {
        Verdict::Denied(Error::PeerClosed)
    }
}

/// Build the grammar probing `target` for a relay to the configured
/// destination.
pub fn new_protocol(target: &ScanTarget, settings: &Settings) -> Result<Box<dyn ProbeProtocol>> {
    let dest = settings.destination;

    let protocol: Box<dyn ProbeProtocol> = match target.dialect {
        Dialect::Socks4 => Box::new(Socks4Probe::new(dest, &settings.socks4_userid)?),
        Dialect::Socks5 => Box::new(Socks5Probe::new(dest, settings.socks5_credentials.clone())?),
        Dialect::Http => Box::new(HttpProbe::new(dest)),
        Dialect::WinGate => Box::new(WinGateProbe::new()),
    };

    Ok(protocol)
}

/// Shorthand for a verdict rejecting a reply that does not follow the
/// dialect's grammar.
pub(super) fn mismatch(dialect: Dialect, what: impl fmt::Display) -> Verdict {
    Verdict::Denied(Error::ProtocolMismatch(format!("{}: {}", dialect, what)))
}
