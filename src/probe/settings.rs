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
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use log::warn;
use structopt::StructOpt;

use super::protocol::{default_scan_targets, ScanTarget};
use crate::net::TcpDialer;

/// Proxy scanner settings, configured by the library user.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address every probe asks the relay to connect to
    pub destination: SocketAddr,
    /// Local address outbound probe sockets bind to
    pub bind_addr: Option<IpAddr>,
    /// IP time-to-live of probe sockets
    pub ttl: Option<u32>,
    /// Jobs probed concurrently, the rest wait in FIFO order
    pub max_concurrent_jobs: usize,
    /// Idle timeout of a single probe connection
    pub probe_timeout: Duration,
    /// Hard limit for a whole job
    pub job_timeout: Duration,
    /// Targets tried when the caller does not name any
    pub scan_targets: Vec<ScanTarget>,
    /// User id sent in SOCKS4 requests
    pub socks4_userid: String,
    /// Username and password offered to SOCKS5 relays
    pub socks5_credentials: Option<(String, String)>,
    /// Number of clean verdicts remembered
    pub cache_size: usize,
    /// How long a clean verdict is remembered
    pub cache_expiry: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            destination: SocketAddr::from(([127, 0, 0, 1], 6667)),
            bind_addr: None,
            ttl: None,
            max_concurrent_jobs: 32,
            probe_timeout: Duration::from_secs(300),
            job_timeout: Duration::from_secs(360),
            scan_targets: default_scan_targets(),
            socks4_userid: String::new(),
            socks5_credentials: None,
            cache_size: 5000,
            cache_expiry: Duration::from_secs(3600),
        }
    }
}

impl Settings {
    pub fn dialer(&self) -> TcpDialer {
        TcpDialer::new(self.bind_addr, self.ttl)
    }

    /// Pull values that would stall the scanner into range: at least one
    /// concurrent job, and a job timeout no shorter than the probe timeout.
    pub fn sanitized(mut self) -> Self {
        if self.max_concurrent_jobs == 0 {
            warn!(target: "probe::settings", "max_concurrent_jobs is 0, using 1");
            self.max_concurrent_jobs = 1;
        }

        if self.job_timeout < self.probe_timeout {
            warn!(
                target: "probe::settings",
                "job_timeout {:?} is shorter than probe_timeout {:?}, raising it",
                self.job_timeout, self.probe_timeout,
            );
            self.job_timeout = self.probe_timeout;
        }

        self
    }
}

// The following is used so we can have scanner settings configurable
// from TOML files.

/// Defines the proxy scanner settings.
#[derive(Clone, Debug, serde::Deserialize, structopt::StructOpt, structopt_toml::StructOptToml)]
#[structopt()]
pub struct SettingsOpt {
    /// Address relays are asked to connect to
    #[structopt(long)]
    pub destination: Option<SocketAddr>,

    /// Local address outbound probes bind to
    #[structopt(long = "bind")]
    pub bind_addr: Option<IpAddr>,

    /// IP time-to-live of probe sockets
    #[structopt(skip)]
    pub ttl: Option<u32>,

    /// Jobs probed concurrently
    #[structopt(long = "max-jobs")]
    pub max_concurrent_jobs: Option<usize>,

    /// Idle timeout of a single probe in seconds
    #[structopt(long)]
    pub probe_timeout: Option<u64>,

    /// Hard limit for a whole job in seconds
    #[structopt(skip)]
    pub job_timeout: Option<u64>,

    /// Targets to try, as dialect:port (e.g. socks5:1080)
    #[serde(default)]
    #[structopt(long = "scan")]
    pub scan_targets: Vec<ScanTarget>,

    /// User id sent in SOCKS4 requests
    #[structopt(skip)]
    pub socks4_userid: Option<String>,

    /// Username offered to SOCKS5 relays
    #[structopt(skip)]
    pub socks5_username: Option<String>,

    /// Password offered to SOCKS5 relays
    #[structopt(skip)]
    pub socks5_password: Option<String>,

    /// Number of clean verdicts remembered
    #[structopt(skip)]
    pub cache_size: Option<usize>,

    /// How long a clean verdict is remembered, in seconds
    #[structopt(skip)]
    pub cache_expiry: Option<u64>,
}

impl From<SettingsOpt> for Settings {
    fn from(opt: SettingsOpt) -> Self {
        let def = Settings::default();

        let socks5_credentials = match (opt.socks5_username, opt.socks5_password) {
            (Some(user), pass) => Some((user, pass.unwrap_or_default())),
            (None, _) => def.socks5_credentials,
        };

        let scan_targets =
            if opt.scan_targets.is_empty() { def.scan_targets } else { opt.scan_targets };

        Self {
            destination: opt.destination.unwrap_or(def.destination),
            bind_addr: opt.bind_addr.or(def.bind_addr),
            ttl: opt.ttl.or(def.ttl),
            max_concurrent_jobs: opt.max_concurrent_jobs.unwrap_or(def.max_concurrent_jobs),
            probe_timeout: opt.probe_timeout.map(Duration::from_secs).unwrap_or(def.probe_timeout),
            job_timeout: opt.job_timeout.map(Duration::from_secs).unwrap_or(def.job_timeout),
            scan_targets,
            socks4_userid: opt.socks4_userid.unwrap_or(def.socks4_userid),
            socks5_credentials,
            cache_size: opt.cache_size.unwrap_or(def.cache_size),
            cache_expiry: opt.cache_expiry.map(Duration::from_secs).unwrap_or(def.cache_expiry),
        }
        .sanitized()
    }
}
