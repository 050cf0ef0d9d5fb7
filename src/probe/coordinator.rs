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
    cell::Cell,
    collections::{BTreeMap, VecDeque},
    fmt,
    net::{IpAddr, SocketAddr},
    rc::Rc,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use super::{
    cache::{CacheKey, CleanCache},
    handler::{ProbeHandler, VerdictQueue},
    protocol::{new_protocol, Dialect, ScanTarget, Verdict},
    settings::Settings,
};
use crate::{
    net::{check_ip, parse_ip, Reactor, Token},
    Result,
};

pub type JobId = u64;

/// Receives the aggregated result of a job, exactly once.
pub type ProbeCallback = Box<dyn FnOnce(ProbeReport) + Send>;

/// Per-job overrides of the scanner [`Settings`]. Unset fields fall back
/// to the settings the coordinator was built with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Targets to try instead of `scan_targets`
    pub targets: Option<Vec<ScanTarget>>,
    /// Idle timeout of each probe of this job
    pub probe_timeout: Option<Duration>,
    /// Hard limit for this job
    pub job_timeout: Option<Duration>,
}

impl ProbeOptions {
    pub fn with_targets(targets: Vec<ScanTarget>) -> Self {
        Self { targets: Some(targets), ..Default::default() }
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// A probe got the candidate to relay a connection
    OpenRelay { dialect: Dialect, port: u16 },
    /// Every probe ended without relaying
    NotRelay,
    /// Timed out before a conclusion could be reached
    Inconclusive,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenRelay { dialect, port } => write!(f, "open {} relay on port {}", dialect, port),
            Self::NotRelay => write!(f, "not a relay"),
            Self::Inconclusive => write!(f, "inconclusive"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeVerdict {
    pub target: ScanTarget,
    pub verdict: Verdict,
}

/// Aggregated result of one job.
#[derive(Clone, Debug)]
pub struct ProbeReport {
    pub job: JobId,
    pub address: IpAddr,
    pub outcome: JobOutcome,
    /// Time since the job was submitted
    pub elapsed: Duration,
    /// One entry per probe actually opened
    pub verdicts: Vec<ProbeVerdict>,
}

impl ProbeReport {
    pub fn confirmed_dialect(&self) -> Option<Dialect> {
        match self.outcome {
            JobOutcome::OpenRelay { dialect, .. } => Some(dialect),
            _ => None,
        }
    }

    pub fn is_open_relay(&self) -> bool {
        self.confirmed_dialect().is_some()
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({} probes, {:.1}s)",
            self.address,
            self.outcome,
            self.verdicts.len(),
            self.elapsed.as_secs_f64()
        )
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub live_probes: usize,
    pub cached: usize,
    pub cache_capacity: usize,
}

impl fmt::Display for CoordinatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} active jobs, {} queued, {} live probes, clean cache {}/{}",
            self.active_jobs, self.queued_jobs, self.live_probes, self.cached, self.cache_capacity
        )
    }
}

struct Probe {
    target: ScanTarget,
    token: Option<Token>,
    verdict: Verdict,
}

struct Job {
    address: IpAddr,
    probes: Vec<Probe>,
    submitted: Instant,
    deadline: Instant,
    cancelled: Rc<Cell<bool>>,
    callback: ProbeCallback,
}

impl Job {
    /// Outcome once every probe is terminal without a confirmation.
    fn settled(&self) -> Option<JobOutcome> {
        if self.probes.is_empty() {
            return Some(JobOutcome::NotRelay)
        }

        if !self.probes.iter().all(|p| p.verdict.is_terminal()) {
            return None
        }

        if self.probes.iter().all(|p| p.verdict.is_timeout()) {
            Some(JobOutcome::Inconclusive)
        } else {
            Some(JobOutcome::NotRelay)
        }
    }
}

struct Queued {
    id: JobId,
    address: IpAddr,
    targets: Vec<ScanTarget>,
    probe_timeout: Duration,
    job_timeout: Duration,
    submitted: Instant,
    callback: ProbeCallback,
}

/// Turns candidate addresses into jobs of concurrent probes on a
/// [`Reactor`] and aggregates their verdicts.
pub struct Coordinator {
    settings: Settings,
    next_job: JobId,
    active: BTreeMap<JobId, Job>,
    queue: VecDeque<Queued>,
    verdicts: VerdictQueue,
    cache: CleanCache,
    completed: Vec<(ProbeCallback, ProbeReport)>,
}

impl Coordinator {
    pub fn new(settings: Settings) -> Self {
        let settings = settings.sanitized();
        let cache = CleanCache::new(settings.cache_size, settings.cache_expiry);

        Self {
            settings,
            next_job: 1,
            active: BTreeMap::new(),
            queue: VecDeque::new(),
            verdicts: VerdictQueue::default(),
            cache,
            completed: vec![],
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn cache(&self) -> &CleanCache {
        &self.cache
    }

    /// Queue a job probing `address`. Only a malformed address fails here;
    /// everything else is reported through `callback`.
    pub fn probe(
        &mut self,
        address: &str,
        options: ProbeOptions,
        callback: ProbeCallback,
    ) -> Result<JobId> {
        let address = parse_ip(address)?;
        self.submit(address, options, callback)
    }

    pub fn submit(
        &mut self,
        address: IpAddr,
        options: ProbeOptions,
        callback: ProbeCallback,
    ) -> Result<JobId> {
        let address = check_ip(address)?;

        let probe_timeout = options.probe_timeout.unwrap_or(self.settings.probe_timeout);
        // A job never gives up before its probes could
        let job_timeout = options.job_timeout.unwrap_or(self.settings.job_timeout).max(probe_timeout);

        let mut targets = options.targets.unwrap_or_else(|| self.settings.scan_targets.clone());
        let mut seen = vec![];
        targets.retain(|t| {
            let fresh = !seen.contains(t);
            seen.push(*t);
            fresh
        });

        let id = self.next_job;
        self.next_job += 1;

        debug!(
            target: "probe::coordinator",
            "job {} queued for {} ({} targets)", id, address, targets.len(),
        );
        self.queue.push_back(Queued {
            id,
            address,
            targets,
            probe_timeout,
            job_timeout,
            submitted: Instant::now(),
            callback,
        });
        Ok(id)
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            active_jobs: self.active.len(),
            queued_jobs: self.queue.len(),
            live_probes: self
                .active
                .values()
                .flat_map(|j| j.probes.iter())
                .filter(|p| p.token.is_some() && !p.verdict.is_terminal())
                .count(),
            cached: self.cache.len(),
            cache_capacity: self.cache.capacity(),
        }
    }

    /// `true` when no job is queued, running, or waiting for its callback.
    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && self.queue.is_empty() && self.completed.is_empty()
    }

    fn has_free_slot(&self) -> bool {
        self.active.len() < self.settings.max_concurrent_jobs
    }

    /// Latest instant the reactor may sleep until before [`Coordinator::process`]
    /// must run again.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.completed.is_empty() ||
            !self.verdicts.borrow().is_empty() ||
            (!self.queue.is_empty() && self.has_free_slot())
        {
            return Some(Instant::now())
        }

        self.active.values().map(|j| j.deadline).min()
    }

    /// Aggregate verdicts, expire jobs, admit queued jobs and deliver
    /// results. Call after every reactor pass, never from inside dispatch.
    pub fn process(&mut self, reactor: &mut Reactor) {
        let now = Instant::now();

        self.collect_verdicts(reactor, now);
        self.expire_jobs(reactor, now);
        self.admit(reactor, now);
        self.run_callbacks();
    }

    fn collect_verdicts(&mut self, reactor: &mut Reactor, now: Instant) {
        let events: Vec<_> = self.verdicts.borrow_mut().drain(..).collect();

        let mut touched = vec![];
        for ev in events {
            // Late verdicts of finalized jobs are dropped
            let Some(job) = self.active.get_mut(&ev.job) else { continue };
            let Some(probe) = job.probes.get_mut(ev.probe) else { continue };
            if probe.verdict.is_terminal() {
                continue
            }

            probe.verdict = ev.verdict;
            probe.token = None;

            if probe.verdict.is_confirmed() {
                let outcome = JobOutcome::OpenRelay {
                    dialect: probe.target.dialect,
                    port: probe.target.port,
                };
                self.finalize(reactor, ev.job, outcome, now);
                continue
            }

            if !touched.contains(&ev.job) {
                touched.push(ev.job);
            }
        }

        for id in touched {
            let Some(outcome) = self.active.get(&id).and_then(|j| j.settled()) else { continue };
            self.finalize(reactor, id, outcome, now);
        }
    }

    fn expire_jobs(&mut self, reactor: &mut Reactor, now: Instant) {
        let expired: Vec<JobId> =
            self.active.iter().filter(|(_, j)| j.deadline <= now).map(|(id, _)| *id).collect();

        for id in expired {
            info!(target: "probe::coordinator", "job {} hit the job timeout", id);
            self.finalize(reactor, id, JobOutcome::Inconclusive, now);
        }
    }

    fn admit(&mut self, reactor: &mut Reactor, now: Instant) {
        while self.has_free_slot() {
            let Some(queued) = self.queue.pop_front() else { break };
            self.start_job(reactor, queued, now);
        }
    }

    fn start_job(&mut self, reactor: &mut Reactor, queued: Queued, now: Instant) {
        let cancelled = Rc::new(Cell::new(false));
        let mut probes = Vec::with_capacity(queued.targets.len());

        for target in queued.targets {
            if self.cache.contains(&CacheKey::new(queued.address, &target), now) {
                debug!(target: "probe::coordinator", "job {} skips cached {}", queued.id, target);
                continue
            }

            let index = probes.len();
            let opened = self.open_probe(
                reactor,
                queued.id,
                index,
                SocketAddr::new(queued.address, target.port),
                &target,
                queued.probe_timeout,
                &cancelled,
            );

            let (token, verdict) = match opened {
                Ok(token) => (Some(token), Verdict::Pending),
                Err(e) => {
                    warn!(target: "probe::coordinator", "job {} {} not started: {}", queued.id, target, e);
                    (None, Verdict::Failed(e))
                }
            };

            probes.push(Probe { target, token, verdict });
        }

        info!(
            target: "probe::coordinator",
            "job {} probing {} with {} probes", queued.id, queued.address, probes.len(),
        );

        let job = Job {
            address: queued.address,
            probes,
            submitted: queued.submitted,
            deadline: now + queued.job_timeout,
            cancelled,
            callback: queued.callback,
        };

        let settled = job.settled();
        self.active.insert(queued.id, job);
        if let Some(outcome) = settled {
            self.finalize(reactor, queued.id, outcome, now);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn open_probe(
        &self,
        reactor: &mut Reactor,
        job: JobId,
        index: usize,
        peer: SocketAddr,
        target: &ScanTarget,
        timeout: Duration,
        cancelled: &Rc<Cell<bool>>,
    ) -> Result<Token> {
        let protocol = new_protocol(target, &self.settings)?;
        let handler = ProbeHandler::new(job, index, protocol, cancelled.clone(), self.verdicts.clone());

        reactor.open_addr(peer, Some(timeout), Box::new(handler))
    }

    /// Settle a job: cancel its remaining probes, remember clean targets
    /// and schedule the callback.
    fn finalize(&mut self, reactor: &mut Reactor, id: JobId, outcome: JobOutcome, now: Instant) {
        let Some(mut job) = self.active.remove(&id) else { return };
        job.cancelled.set(true);

        for probe in job.probes.iter_mut() {
            if let Some(token) = probe.token.take() {
                reactor.close(token);
            }

            if !probe.verdict.is_terminal() {
                probe.verdict = Verdict::Cancelled;
            }

            if probe.verdict.is_definitive_denial() {
                self.cache.insert(CacheKey::new(job.address, &probe.target), now);
            }
        }

        let report = ProbeReport {
            job: id,
            address: job.address,
            outcome,
            elapsed: now.saturating_duration_since(job.submitted),
            verdicts: job
                .probes
                .into_iter()
                .map(|p| ProbeVerdict { target: p.target, verdict: p.verdict })
                .collect(),
        };

        info!(target: "probe::coordinator", "job {} {}", id, report);
        self.completed.push((job.callback, report));
    }

    fn run_callbacks(&mut self) {
        for (callback, report) in std::mem::take(&mut self.completed) {
            callback(report);
        }
    }

    /// Finalize every running and queued job as inconclusive.
    pub fn shutdown(&mut self, reactor: &mut Reactor) {
        let now = Instant::now();

        let ids: Vec<JobId> = self.active.keys().copied().collect();
        for id in ids {
            self.finalize(reactor, id, JobOutcome::Inconclusive, now);
        }

        for queued in std::mem::take(&mut self.queue) {
            let report = ProbeReport {
                job: queued.id,
                address: queued.address,
                outcome: JobOutcome::Inconclusive,
                elapsed: now.saturating_duration_since(queued.submitted),
                verdicts: vec![],
            };
            self.completed.push((queued.callback, report));
        }

        self.verdicts.borrow_mut().clear();
        self.run_callbacks();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{net::TcpDialer, Error};

    fn collector() -> (Arc<Mutex<Vec<ProbeReport>>>, impl Fn() -> ProbeCallback) {
        let reports = Arc::new(Mutex::new(vec![]));
        let r = reports.clone();
        (reports, move || {
            let r = r.clone();
            Box::new(move |report| r.lock().unwrap().push(report)) as ProbeCallback
        })
    }

    #[test]
    fn malformed_address_rejected() {
        let mut coord = Coordinator::new(Settings::default());
        let (reports, cb) = collector();

        for bad in ["", "proxy.example.org", "0.0.0.0", "ff02::1"] {
            assert!(matches!(coord.probe(bad, ProbeOptions::default(), cb()), Err(Error::AddressError(_))));
        }

        assert!(coord.is_idle());
        assert!(reports.lock().unwrap().is_empty());
    }

    #[test]
    fn duplicate_targets_collapse() {
        let mut coord = Coordinator::new(Settings::default());
        let (_, cb) = collector();

        let t = ScanTarget::new(Dialect::Http, 8080);
        coord.probe("192.0.2.1", ProbeOptions::with_targets(vec![t, t]), cb()).unwrap();
        assert_eq!(coord.queue[0].targets, vec![t]);
        assert_eq!(coord.status().queued_jobs, 1);
    }

    #[test]
    fn all_cached_job_is_clean() {
        let mut reactor = Reactor::new(TcpDialer::default()).unwrap();
        let mut coord = Coordinator::new(Settings::default());
        let (reports, cb) = collector();

        let address: IpAddr = "192.0.2.1".parse().unwrap();
        let target = ScanTarget::new(Dialect::Socks5, 1080);
        coord.cache.insert(CacheKey::new(address, &target), Instant::now());

        coord.probe("192.0.2.1", ProbeOptions::with_targets(vec![target]), cb()).unwrap();
        assert_eq!(coord.next_deadline().map(|d| d <= Instant::now()), Some(true));
        coord.process(&mut reactor);

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, JobOutcome::NotRelay);
        assert!(reports[0].verdicts.is_empty());
        assert!(reactor.is_empty());
        assert!(coord.is_idle());
    }

    #[test]
    fn shutdown_reports_queued_jobs() {
        let mut reactor = Reactor::new(TcpDialer::default()).unwrap();
        let settings = Settings { max_concurrent_jobs: 1, ..Default::default() };
        let mut coord = Coordinator::new(settings);
        let (reports, cb) = collector();

        let target = ProbeOptions::with_targets(vec![ScanTarget::new(Dialect::WinGate, 23)]);
        coord.probe("192.0.2.1", target.clone(), cb()).unwrap();
        coord.probe("192.0.2.2", target, cb()).unwrap();
        coord.process(&mut reactor);
        assert_eq!(coord.status().active_jobs, 1);
        assert_eq!(coord.status().queued_jobs, 1);

        coord.shutdown(&mut reactor);
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.outcome == JobOutcome::Inconclusive));
        assert_eq!(reports[0].verdicts[0].verdict, Verdict::Cancelled);
        assert!(reactor.is_empty());
    }

    #[test]
    fn job_options_override_settings() {
        let mut coord = Coordinator::new(Settings::default());
        let (_, cb) = collector();

        coord.probe("192.0.2.1", ProbeOptions::default(), cb()).unwrap();
        let options = ProbeOptions::default()
            .probe_timeout(Duration::from_secs(5))
            .job_timeout(Duration::from_secs(9));
        coord.probe("192.0.2.2", options, cb()).unwrap();
        // A job limit shorter than the idle timeout is raised to it
        let options = ProbeOptions::default().job_timeout(Duration::from_secs(1));
        coord.probe("192.0.2.3", options, cb()).unwrap();

        let timeouts: Vec<_> =
            coord.queue.iter().map(|q| (q.probe_timeout, q.job_timeout)).collect();
        assert_eq!(
            timeouts,
            vec![
                (Duration::from_secs(300), Duration::from_secs(360)),
                (Duration::from_secs(5), Duration::from_secs(9)),
                (Duration::from_secs(300), Duration::from_secs(300)),
            ]
        );
    }

    #[test]
    fn stalling_settings_are_pulled_into_range() {
        let settings = Settings {
            max_concurrent_jobs: 0,
            probe_timeout: Duration::from_secs(60),
            job_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let mut reactor = Reactor::new(TcpDialer::default()).unwrap();
        let mut coord = Coordinator::new(settings);
        assert_eq!(coord.settings.max_concurrent_jobs, 1);
        assert_eq!(coord.settings.job_timeout, Duration::from_secs(60));

        let (_, cb) = collector();
        let target = ScanTarget::new(Dialect::WinGate, 23);
        coord.probe("192.0.2.1", ProbeOptions::with_targets(vec![target]), cb()).unwrap();
        coord.process(&mut reactor);
        assert_eq!(coord.status().active_jobs, 1);
        assert_eq!(coord.status().queued_jobs, 0);
        coord.shutdown(&mut reactor);
    }
}
