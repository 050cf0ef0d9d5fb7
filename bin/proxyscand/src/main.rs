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
    io::{self, BufRead},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{debug, error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use smol::channel::{self, Sender};
use structopt_toml::{serde::Deserialize, structopt::StructOpt, StructOptToml};

use proxyscan::{
    probe::{ProbeClient, ProbeOptions, ProbeReport, ProbeService, Settings, SettingsOpt},
    util::{
        cli::{init_logger, spawn_config},
        path::{expand_path, get_config_path},
    },
    Error, Result,
};

const CONFIG_FILE: &str = "proxyscand_config.toml";
const CONFIG_FILE_CONTENTS: &str = include_str!("../proxyscand_config.toml");

#[derive(Clone, Debug, Deserialize, StructOpt, StructOptToml)]
#[serde(default)]
#[structopt(name = "proxyscand")]
struct Args {
    #[structopt(short, long)]
    /// Configuration file to use
    config: Option<String>,

    #[structopt(short, long)]
    /// Set log file to output to
    log: Option<String>,

    #[structopt(short, parse(from_occurrences))]
    /// Increase verbosity (-vvv supported)
    verbose: u8,

    #[structopt(long)]
    /// Candidate address to probe (repeatable)
    check: Vec<String>,

    #[structopt(long)]
    /// Read candidate addresses from stdin, one per line
    stdin: bool,

    #[structopt(flatten)]
    net: SettingsOpt,
}

fn parse_args(config: &str) -> Result<Args> {
    Args::from_args_with_toml(config).map_err(|e| Error::ConfigInvalid(e.to_string()))
}

fn main() -> Result<()> {
    let args = parse_args("")?;
    let cfg_path = get_config_path(args.config, CONFIG_FILE)?;
    spawn_config(&cfg_path, CONFIG_FILE_CONTENTS.as_bytes())?;

    let args = parse_args(&std::fs::read_to_string(&cfg_path)?)?;

    let log_file = args.log.as_deref().map(expand_path).transpose()?;
    init_logger(args.verbose.into(), log_file.as_deref())?;

    realmain(args)
}

fn realmain(args: Args) -> Result<()> {
    let settings: Settings = args.net.into();
    info!(
        target: "proxyscand",
        "Probing {} targets per candidate, relays are asked to reach {}",
        settings.scan_targets.len(), settings.destination,
    );

    let (client, reactor_thread) = ProbeService::spawn(settings)?;

    // Graceful termination: unfinished candidates report as inconclusive
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, term.clone())?;
    signal_hook::flag::register(SIGTERM, term.clone())?;

    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let (client, term, done) = (client.clone(), term.clone(), done.clone());
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                if term.load(Ordering::Relaxed) {
                    info!(target: "proxyscand", "Caught termination signal, stopping...");
                    if let Err(e) = client.stop() {
                        warn!(target: "proxyscand", "Failed stopping probe service: {}", e);
                    }
                    break
                }
                thread::sleep(Duration::from_millis(200));
            }
        })
    };

    let (report_tx, report_rx) = channel::unbounded::<ProbeReport>();
    let printer = thread::spawn(move || {
        let mut open = 0;
        while let Ok(report) = report_rx.recv_blocking() {
            if report.is_open_relay() {
                open += 1;
            }

            println!("{}", report);
            for v in &report.verdicts {
                debug!(target: "proxyscand", "  {} {}", v.target, v.verdict);
            }
        }
        open
    });

    for address in &args.check {
        submit(&client, address, &report_tx);
    }

    if args.stdin {
        for line in io::stdin().lock().lines() {
            if term.load(Ordering::Relaxed) {
                break
            }

            let line = line?;
            let address = line.trim();
            if address.is_empty() || address.starts_with('#') {
                continue
            }

            submit(&client, address, &report_tx);
        }
    }

    // The printer exits once every pending callback has run
    drop(report_tx);
    let open = printer.join().unwrap_or(0);

    if !term.load(Ordering::Relaxed) {
        match client.status() {
            Ok(status) => info!(target: "proxyscand", "{}", status),
            Err(e) => warn!(target: "proxyscand", "Status unavailable: {}", e),
        }
        client.stop()?;
    }

    done.store(true, Ordering::Relaxed);
    let _ = watcher.join();

    match reactor_thread.join() {
        Ok(result) => result?,
        Err(_) => error!(target: "proxyscand", "Reactor thread panicked"),
    }

    info!(target: "proxyscand", "Found {} open relays", open);
    Ok(())
}

fn submit(client: &ProbeClient, address: &str, reports: &Sender<ProbeReport>) {
    let tx = reports.clone();
    let callback = Box::new(move |report: ProbeReport| {
        let _ = tx.try_send(report);
    });

    match client.probe(address, ProbeOptions::default(), callback) {
        Ok(()) => debug!(target: "proxyscand", "Queued {}", address),
        Err(e) => warn!(target: "proxyscand", "Skipping {}: {}", address, e),
    }
}
