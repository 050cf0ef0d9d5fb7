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

//! End-to-end probing against scripted relays on loopback.

use std::{
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use log::warn;
use proxyscan::{
    net::Reactor,
    probe::{
        Coordinator, Dialect, JobOutcome, ProbeCallback, ProbeOptions, ProbeReport, ProbeService,
        ScanTarget, Settings, Verdict,
    },
    Error,
};

fn init_logger() {
    let mut cfg = simplelog::ConfigBuilder::new();
    cfg.add_filter_ignore("net::reactor".to_string());

    if simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        cfg.build(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )
    .is_err()
    {
        warn!(target: "test_harness", "Logger already initialized");
    }
}

/// Relay serving every accepted connection with `script` on its own
/// thread. Returns the port and a counter of accepted connections.
fn fake_relay<F>(script: F) -> (u16, Arc<AtomicUsize>)
where
    F: Fn(TcpStream) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let script = Arc::new(script);

    let counter = accepted.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            counter.fetch_add(1, Ordering::SeqCst);
            let script = script.clone();
            thread::spawn(move || script(stream));
        }
    });

    (port, accepted)
}

/// Port nobody listens on.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn read_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = vec![];
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    head
}

/// Hold the connection until the prober hangs up.
fn linger(mut stream: TcpStream) {
    let _ = io::copy(&mut stream, &mut io::sink());
}

fn socks4_granted(mut stream: TcpStream) {
    let mut req = [0u8; 9];
    if stream.read_exact(&mut req).is_ok() && req[..2] == [4, 1] {
        let _ = stream.write_all(&[0, 90, 0, 0, 0, 0, 0, 0]);
    }
    linger(stream);
}

fn socks4_rejected(mut stream: TcpStream) {
    let mut req = [0u8; 9];
    if stream.read_exact(&mut req).is_ok() {
        let _ = stream.write_all(&[0, 91, 0, 0, 0, 0, 0, 0]);
    }
}

fn socks4_split(mut stream: TcpStream) {
    let mut req = [0u8; 9];
    if stream.read_exact(&mut req).is_ok() {
        let _ = stream.write_all(&[0]);
        let _ = stream.flush();
        thread::sleep(Duration::from_millis(100));
        let _ = stream.write_all(&[90, 0, 0, 0, 0, 0, 0]);
    }
    linger(stream);
}

fn socks5_open(mut stream: TcpStream) {
    let mut greeting = [0u8; 3];
    if stream.read_exact(&mut greeting).is_err() || greeting != [5, 1, 0] {
        return
    }
    let _ = stream.write_all(&[5, 0]);

    let mut req = [0u8; 10];
    if stream.read_exact(&mut req).is_ok() && req[..4] == [5, 1, 0, 1] {
        let _ = stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    }
    linger(stream);
}

fn ssh_banner(mut stream: TcpStream) {
    let _ = stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n");
    linger(stream);
}

fn http_open(mut stream: TcpStream) {
    let head = read_head(&mut stream);
    if head.starts_with(b"CONNECT 127.0.0.1:6667 HTTP/1.0\r\n") {
        let _ = stream.write_all(b"HTTP/1.0 200 Connection established\r\n\r\n");
    }
    linger(stream);
}

fn http_forbidden(mut stream: TcpStream) {
    read_head(&mut stream);
    let _ = stream.write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n");
}

fn wingate_prompt(mut stream: TcpStream) {
    let _ = stream.write_all(b"WinGate>");
    linger(stream);
}

/// Keeps the connection busy without ever answering.
fn trickle(mut stream: TcpStream) {
    while stream.write_all(b".").is_ok() {
        thread::sleep(Duration::from_millis(50));
    }
}

type Reports = Arc<Mutex<Vec<ProbeReport>>>;

fn collector() -> (Reports, impl Fn() -> ProbeCallback) {
    let reports = Reports::default();
    let r = reports.clone();
    (reports, move || {
        let r = r.clone();
        Box::new(move |report| r.lock().unwrap().push(report)) as ProbeCallback
    })
}

fn quick_settings() -> Settings {
    Settings {
        probe_timeout: Duration::from_secs(5),
        job_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

/// Drive reactor and coordinator until the coordinator is idle or
/// `limit` passes. `check` runs after every pass.
fn drive(
    reactor: &mut Reactor,
    coord: &mut Coordinator,
    limit: Duration,
    mut check: impl FnMut(&Coordinator),
) {
    let start = Instant::now();

    loop {
        coord.process(reactor);
        check(coord);
        if coord.is_idle() {
            return
        }

        assert!(start.elapsed() < limit, "coordinator still busy after {:?}", limit);

        let cap = Instant::now() + Duration::from_millis(50);
        let deadline = coord.next_deadline().map_or(cap, |d| d.min(cap));
        reactor.run_once(Some(deadline)).unwrap();
    }
}

fn setup(settings: Settings) -> (Reactor, Coordinator) {
    init_logger();
    (Reactor::new(settings.dialer()).unwrap(), Coordinator::new(settings))
}

#[test]
fn every_dialect_confirms() {
    let relays: [(Dialect, fn(TcpStream)); 4] = [
        (Dialect::Socks4, socks4_granted),
        (Dialect::Socks5, socks5_open),
        (Dialect::Http, http_open),
        (Dialect::WinGate, wingate_prompt),
    ];

    for (dialect, script) in relays {
        let (mut reactor, mut coord) = setup(quick_settings());
        let (reports, cb) = collector();

        let (port, _) = fake_relay(script);
        let target = ScanTarget::new(dialect, port);
        coord.probe("127.0.0.1", ProbeOptions::with_targets(vec![target]), cb()).unwrap();
        drive(&mut reactor, &mut coord, Duration::from_secs(5), |_| {});

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1, "{}", dialect);
        assert_eq!(reports[0].outcome, JobOutcome::OpenRelay { dialect, port });
        assert_eq!(reports[0].confirmed_dialect(), Some(dialect));
        assert_eq!(reports[0].verdicts[0].verdict, Verdict::Confirmed);
        assert!(reactor.is_empty());
    }
}

#[test]
fn confirmation_cancels_siblings() {
    let (mut reactor, mut coord) = setup(quick_settings());
    let (reports, cb) = collector();

    let (open, _) = fake_relay(socks5_open);
    let (silent, _) = fake_relay(linger);
    let targets = vec![ScanTarget::new(Dialect::Http, silent), ScanTarget::new(Dialect::Socks5, open)];

    coord.probe("127.0.0.1", ProbeOptions::with_targets(targets), cb()).unwrap();
    drive(&mut reactor, &mut coord, Duration::from_secs(4), |_| {});

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.outcome, JobOutcome::OpenRelay { dialect: Dialect::Socks5, port: open });
    assert!(report.elapsed < Duration::from_secs(4));
    assert_eq!(report.verdicts[0].verdict, Verdict::Cancelled);
    assert_eq!(report.verdicts[1].verdict, Verdict::Confirmed);

    // Every sibling socket is gone
    assert!(reactor.is_empty());
    assert!(coord.cache().is_empty());
}

#[test]
fn refused_sibling_does_not_block_confirmation() {
    let (mut reactor, mut coord) = setup(quick_settings());
    let (reports, cb) = collector();

    let (open, _) = fake_relay(socks4_granted);
    let refused = closed_port();
    let targets =
        vec![ScanTarget::new(Dialect::Socks4, open), ScanTarget::new(Dialect::Socks5, refused)];

    coord.probe("127.0.0.1", ProbeOptions::with_targets(targets), cb()).unwrap();
    drive(&mut reactor, &mut coord, Duration::from_secs(4), |_| {});

    let reports = reports.lock().unwrap();
    assert_eq!(reports[0].outcome, JobOutcome::OpenRelay { dialect: Dialect::Socks4, port: open });
    assert_ne!(reports[0].verdicts[1].verdict, Verdict::Confirmed);
    assert!(reactor.is_empty());
}

#[test]
fn denials_are_clean_and_cached() {
    let (mut reactor, mut coord) = setup(quick_settings());
    let (reports, cb) = collector();

    let (socks4, socks4_hits) = fake_relay(socks4_rejected);
    let (http, http_hits) = fake_relay(http_forbidden);
    let (socks5, _) = fake_relay(ssh_banner);
    let targets = vec![
        ScanTarget::new(Dialect::Socks4, socks4),
        ScanTarget::new(Dialect::Http, http),
        ScanTarget::new(Dialect::Socks5, socks5),
    ];

    coord.probe("127.0.0.1", ProbeOptions::with_targets(targets.clone()), cb()).unwrap();
    drive(&mut reactor, &mut coord, Duration::from_secs(4), |_| {});

    {
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, JobOutcome::NotRelay);
        assert!(reports[0].verdicts.iter().all(|v| v.verdict.is_definitive_denial()));
        assert!(matches!(
            reports[0].verdicts[1].verdict,
            Verdict::Denied(Error::RelayDenied(ref m)) if m.contains("403")
        ));
        assert!(matches!(
            reports[0].verdicts[2].verdict,
            Verdict::Denied(Error::ProtocolMismatch(_))
        ));
    }
    assert_eq!(coord.cache().len(), 3);

    // A few more passes must not report the job again
    for _ in 0..3 {
        reactor.run_once(Some(Instant::now() + Duration::from_millis(20))).unwrap();
        coord.process(&mut reactor);
    }
    assert_eq!(reports.lock().unwrap().len(), 1);

    // Second pass over the same candidate touches no relay
    coord.probe("127.0.0.1", ProbeOptions::with_targets(targets), cb()).unwrap();
    drive(&mut reactor, &mut coord, Duration::from_secs(1), |_| {});

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1].outcome, JobOutcome::NotRelay);
    assert!(reports[1].verdicts.is_empty());
    assert_eq!(socks4_hits.load(Ordering::SeqCst), 1);
    assert_eq!(http_hits.load(Ordering::SeqCst), 1);
}

#[test]
fn silent_relays_are_inconclusive() {
    let settings = Settings {
        probe_timeout: Duration::from_millis(300),
        job_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let (mut reactor, mut coord) = setup(settings);
    let (reports, cb) = collector();

    let (a, _) = fake_relay(linger);
    let (b, _) = fake_relay(linger);
    let targets = vec![ScanTarget::new(Dialect::Socks4, a), ScanTarget::new(Dialect::Http, b)];

    coord.probe("127.0.0.1", ProbeOptions::with_targets(targets), cb()).unwrap();
    drive(&mut reactor, &mut coord, Duration::from_secs(4), |_| {});

    let reports = reports.lock().unwrap();
    let report = &reports[0];
    assert_eq!(report.outcome, JobOutcome::Inconclusive);
    assert!(report.elapsed >= Duration::from_millis(300));
    assert!(report.elapsed < Duration::from_secs(5));
    assert!(report.verdicts.iter().all(|v| v.verdict.is_timeout()));

    // Timeouts prove nothing, nothing is remembered
    assert!(coord.cache().is_empty());
    assert!(reactor.is_empty());
}

#[test]
fn job_timeout_cuts_probes_short() {
    let settings = Settings {
        probe_timeout: Duration::from_millis(300),
        job_timeout: Duration::from_millis(700),
        ..Default::default()
    };
    let (mut reactor, mut coord) = setup(settings);
    let (reports, cb) = collector();

    // Never idle long enough for the probe timeout to fire
    let (busy, _) = fake_relay(trickle);
    let target = ScanTarget::new(Dialect::WinGate, busy);
    coord.probe("127.0.0.1", ProbeOptions::with_targets(vec![target]), cb()).unwrap();
    drive(&mut reactor, &mut coord, Duration::from_secs(4), |_| {});

    let reports = reports.lock().unwrap();
    assert_eq!(reports[0].outcome, JobOutcome::Inconclusive);
    assert!(reports[0].elapsed >= Duration::from_millis(700));
    assert!(reports[0].elapsed < Duration::from_secs(4));
    assert_eq!(reports[0].verdicts[0].verdict, Verdict::Cancelled);
    assert!(reactor.is_empty());
}

#[test]
fn timeouts_apply_per_job() {
    let (mut reactor, mut coord) = setup(quick_settings());
    let (reports, cb) = collector();

    let (silent, _) = fake_relay(linger);
    let (busy, _) = fake_relay(trickle);

    let quick = ProbeOptions::with_targets(vec![ScanTarget::new(Dialect::Socks4, silent)])
        .probe_timeout(Duration::from_millis(200));
    let slow = ProbeOptions::with_targets(vec![ScanTarget::new(Dialect::Socks4, silent)])
        .probe_timeout(Duration::from_millis(800));
    let capped = ProbeOptions::with_targets(vec![ScanTarget::new(Dialect::WinGate, busy)])
        .probe_timeout(Duration::from_millis(200))
        .job_timeout(Duration::from_millis(500));

    let quick = coord.probe("127.0.0.1", quick, cb()).unwrap();
    let slow = coord.probe("127.0.0.1", slow, cb()).unwrap();
    let capped = coord.probe("127.0.0.1", capped, cb()).unwrap();
    drive(&mut reactor, &mut coord, Duration::from_secs(4), |_| {});

    let reports = reports.lock().unwrap();
    let order: Vec<_> = reports.iter().map(|r| r.job).collect();
    assert_eq!(order, vec![quick, capped, slow]);
    assert!(reports.iter().all(|r| r.outcome == JobOutcome::Inconclusive));

    assert!(reports[0].elapsed >= Duration::from_millis(200));
    assert!(reports[0].verdicts[0].verdict.is_timeout());
    assert!(reports[1].elapsed >= Duration::from_millis(500));
    assert_eq!(reports[1].verdicts[0].verdict, Verdict::Cancelled);
    assert!(reports[2].elapsed >= Duration::from_millis(800));
    assert!(reports[2].elapsed < Duration::from_secs(4));
    assert!(reports[2].verdicts[0].verdict.is_timeout());
}

#[test]
fn split_reply_is_reassembled() {
    let (mut reactor, mut coord) = setup(quick_settings());
    let (reports, cb) = collector();

    let (port, _) = fake_relay(socks4_split);
    coord.probe("127.0.0.1", ProbeOptions::with_targets(vec![ScanTarget::new(Dialect::Socks4, port)]), cb()).unwrap();
    drive(&mut reactor, &mut coord, Duration::from_secs(4), |_| {});

    let reports = reports.lock().unwrap();
    assert_eq!(reports[0].outcome, JobOutcome::OpenRelay { dialect: Dialect::Socks4, port });
}

#[test]
fn admission_is_bounded_and_fifo() {
    let settings = Settings { max_concurrent_jobs: 1, ..quick_settings() };
    let (mut reactor, mut coord) = setup(settings);
    let (reports, cb) = collector();

    let (port, _) = fake_relay(wingate_prompt);
    let mut ids = vec![];
    for _ in 0..4 {
        let target = ScanTarget::new(Dialect::WinGate, port);
        ids.push(coord.probe("127.0.0.1", ProbeOptions::with_targets(vec![target]), cb()).unwrap());
    }
    assert_eq!(coord.status().queued_jobs, 4);

    let mut peak = 0;
    drive(&mut reactor, &mut coord, Duration::from_secs(5), |c| {
        peak = peak.max(c.status().active_jobs);
    });
    assert_eq!(peak, 1);

    let reports = reports.lock().unwrap();
    let order: Vec<_> = reports.iter().map(|r| r.job).collect();
    assert_eq!(order, ids);
    assert!(reports.iter().all(|r| r.is_open_relay()));
}

#[test]
fn service_answers_across_threads() {
    init_logger();

    let (port, _) = fake_relay(http_open);
    let (client, handle) = ProbeService::spawn(quick_settings()).unwrap();

    assert!(matches!(client.probe_channel("not-an-ip", ProbeOptions::default()), Err(Error::AddressError(_))));

    let rx = client
        .probe_channel("127.0.0.1", ProbeOptions::with_targets(vec![ScanTarget::new(Dialect::Http, port)]))
        .unwrap();
    let report = rx.recv_blocking().unwrap();
    assert_eq!(report.outcome, JobOutcome::OpenRelay { dialect: Dialect::Http, port });

    let status = client.status().unwrap();
    assert_eq!(status.active_jobs, 0);
    assert_eq!(status.queued_jobs, 0);

    client.stop().unwrap();
    handle.join().unwrap().unwrap();

    // Requests after stopping are refused
    assert!(client.status().is_err());
}

#[test]
fn stop_settles_running_jobs() {
    init_logger();

    let (silent, _) = fake_relay(linger);
    let (client, handle) = ProbeService::spawn(quick_settings()).unwrap();

    let rx = client
        .probe_channel("127.0.0.1", ProbeOptions::with_targets(vec![ScanTarget::new(Dialect::Socks5, silent)]))
        .unwrap();
    let status = client.status().unwrap();
    assert_eq!(status.active_jobs + status.queued_jobs, 1);

    client.stop().unwrap();
    let report = rx.recv_blocking().unwrap();
    assert_eq!(report.outcome, JobOutcome::Inconclusive);
    assert_eq!(report.verdicts[0].verdict, Verdict::Cancelled);

    handle.join().unwrap().unwrap();
}
