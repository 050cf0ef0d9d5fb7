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

/// Dialects, scan targets, verdicts and the socket-free
/// [`protocol::ProbeProtocol`] trait every dialect implements.
pub mod protocol;

/// SOCKS4 CONNECT grammar
pub mod socks4;

/// SOCKS5 CONNECT grammar, with optional username/password
/// authentication
pub mod socks5;

/// HTTP CONNECT grammar
pub mod http;

/// WinGate banner grammar
pub mod wingate;

/// Reactor handler running one protocol over one endpoint and
/// reporting its verdict to the coordinator.
pub mod handler;

/// Bounded memory of targets recently verified clean.
pub mod cache;

/// Job admission, aggregation of probe verdicts into a single
/// result per candidate, and job timeouts.
///
/// Verdicts travel from the handlers to the coordinator through a
/// queue drained after each reactor pass. Once a job is settled its
/// cancel flag is raised and every sibling endpoint is closed.
pub mod coordinator;

/// Scanner settings
pub mod settings;

/// Reactor thread and its cross-thread client handle.
pub mod service;

pub use coordinator::{
    Coordinator, CoordinatorStatus, JobId, JobOutcome, ProbeCallback, ProbeOptions, ProbeReport,
    ProbeVerdict,
};
pub use protocol::{default_scan_targets, Dialect, ProbeState, ScanTarget, Verdict};
pub use service::{ProbeClient, ProbeService};
pub use settings::{Settings, SettingsOpt};
