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

use std::{net::IpAddr, thread};

use log::{debug, info, warn};
use smol::channel::{self, Receiver, Sender};

use super::{
    coordinator::{Coordinator, CoordinatorStatus, ProbeCallback, ProbeOptions, ProbeReport},
    settings::Settings,
};
use crate::{
    net::{parse_ip, Reactor, Waker},
    Result,
};

/// Requests marshalled onto the reactor thread.
pub enum Submission {
    Probe { address: IpAddr, options: ProbeOptions, callback: ProbeCallback },
    Status(Sender<CoordinatorStatus>),
    Stop,
}

/// Thread-safe handle to a running [`ProbeService`].
#[derive(Clone)]
pub struct ProbeClient {
    sender: Sender<Submission>,
    waker: Waker,
}

impl ProbeClient {
    fn submit(&self, submission: Submission) -> Result<()> {
        self.sender.try_send(submission)?;
        self.waker.wake()
    }

    /// Probe `address` and hand the report to `callback`, which runs on
    /// the reactor thread. A malformed address fails right here.
    pub fn probe(
        &self,
        address: &str,
        options: ProbeOptions,
        callback: ProbeCallback,
    ) -> Result<()> {
        let address = parse_ip(address)?;
        self.submit(Submission::Probe { address, options, callback })
    }

    /// Like [`ProbeClient::probe`], delivering the report on a channel.
    pub fn probe_channel(
        &self,
        address: &str,
        options: ProbeOptions,
    ) -> Result<Receiver<ProbeReport>> {
        let (tx, rx) = channel::bounded(1);
        self.probe(
            address,
            options,
            Box::new(move |report| {
                if tx.try_send(report).is_err() {
                    debug!(target: "probe::service", "Report receiver dropped");
                }
            }),
        )?;
        Ok(rx)
    }

    /// Blocks until the reactor thread answers.
    pub fn status(&self) -> Result<CoordinatorStatus> {
        let (tx, rx) = channel::bounded(1);
        self.submit(Submission::Status(tx))?;
        Ok(rx.recv_blocking()?)
    }

    /// Ask the service to finish. Unfinished jobs report `Inconclusive`.
    pub fn stop(&self) -> Result<()> {
        self.submit(Submission::Stop)
    }
}

/// Reactor and coordinator driven together on one thread.
pub struct ProbeService {
    reactor: Reactor,
    coordinator: Coordinator,
    sender: Sender<Submission>,
    receiver: Receiver<Submission>,
    stopped: bool,
}

impl ProbeService {
    pub fn new(settings: Settings) -> Result<Self> {
        let reactor = Reactor::new(settings.dialer())?;
        let coordinator = Coordinator::new(settings);
        let (sender, receiver) = channel::unbounded();

        Ok(Self { reactor, coordinator, sender, receiver, stopped: false })
    }

    pub fn client(&self) -> ProbeClient {
        ProbeClient { sender: self.sender.clone(), waker: self.reactor.waker() }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn drain_submissions(&mut self) {
        while let Ok(submission) = self.receiver.try_recv() {
            match submission {
                Submission::Probe { address, options, callback } => {
                    if let Err(e) = self.coordinator.submit(address, options, callback) {
                        warn!(target: "probe::service", "Dropping probe of {}: {}", address, e);
                    }
                }
                Submission::Status(tx) => {
                    let _ = tx.try_send(self.coordinator.status());
                }
                Submission::Stop => {
                    debug!(target: "probe::service", "Stop requested");
                    self.stopped = true;
                }
            }
        }
    }

    /// One reactor pass bracketed by submission intake and job bookkeeping.
    pub fn run_once(&mut self) -> Result<()> {
        self.drain_submissions();
        self.coordinator.process(&mut self.reactor);
        if self.stopped {
            return Ok(())
        }

        self.reactor.run_once(self.coordinator.next_deadline())?;

        self.drain_submissions();
        self.coordinator.process(&mut self.reactor);
        Ok(())
    }

    /// Run until stopped, then settle every job and close all sockets.
    pub fn run(mut self) -> Result<()> {
        info!(target: "probe::service", "Probe service started");

        let result = loop {
            if self.stopped {
                break Ok(())
            }

            if let Err(e) = self.run_once() {
                break Err(e)
            }
        };

        // Refuse new submissions, but settle whatever is already queued
        self.receiver.close();
        self.drain_submissions();

        self.coordinator.shutdown(&mut self.reactor);
        self.reactor.shutdown();
        info!(target: "probe::service", "Probe service stopped");
        result
    }

    /// Start a service on its own thread.
    pub fn spawn(settings: Settings) -> Result<(ProbeClient, thread::JoinHandle<Result<()>>)> {
        let (tx, rx) = channel::bounded(1);

        let handle = thread::Builder::new().name("proxyscan-reactor".to_string()).spawn(
            move || {
                let service = match ProbeService::new(settings) {
                    Ok(service) => service,
                    Err(e) => {
                        let _ = tx.send_blocking(Err(e.clone()));
                        return Err(e)
                    }
                };

                let _ = tx.send_blocking(Ok(service.client()));
                service.run()
            },
        )?;

        let client = rx.recv_blocking()??;
        Ok((client, handle))
    }
}
