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
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use log::debug;

use super::{
    coordinator::JobId,
    protocol::{ProbeProtocol, Step, Verdict},
};
use crate::{
    net::{Endpoint, Handler},
    Error,
};

/// Verdict of one probe, waiting to be picked up by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerdictEvent {
    pub job: JobId,
    pub probe: usize,
    pub verdict: Verdict,
}

pub type VerdictQueue = Rc<RefCell<VecDeque<VerdictEvent>>>;

/// Socket side of a probe: feeds endpoint events into a [`ProbeProtocol`]
/// and reports its verdict exactly once.
pub struct ProbeHandler {
    job: JobId,
    probe: usize,
    protocol: Box<dyn ProbeProtocol>,
    /// Set by the coordinator once a sibling settled the job
    cancelled: Rc<Cell<bool>>,
    verdicts: VerdictQueue,
    reported: bool,
}

impl ProbeHandler {
    pub fn new(
        job: JobId,
        probe: usize,
        protocol: Box<dyn ProbeProtocol>,
        cancelled: Rc<Cell<bool>>,
        verdicts: VerdictQueue,
    ) -> Self {
        Self { job, probe, protocol, cancelled, verdicts, reported: false }
    }

    /// Stop reacting once the job is settled. Returns `true` if cancelled.
    fn check_cancelled(&mut self, ep: &mut Endpoint) -> bool {
        if self.cancelled.get() {
            self.reported = true;
            ep.close();
            return true
        }

        false
    }

    fn report(&mut self, ep: &mut Endpoint, verdict: Verdict) {
        if self.reported {
            return
        }
        self.reported = true;

        debug!(
            target: "probe::handler",
            "job {} {} probe of {}: {}", self.job, self.protocol.dialect(), ep.peer_addr(), verdict,
        );

        self.verdicts.borrow_mut().push_back(VerdictEvent {
            job: self.job,
            probe: self.probe,
            verdict,
        });
        ep.close();
    }

    fn drive(&mut self, ep: &mut Endpoint, mut step: Step) {
        loop {
            match step {
                Step::Wait => return,
                Step::Finish(verdict) => return self.report(ep, verdict),
                Step::Send(bytes) => {
                    if let Err(e) = ep.send(&bytes) {
                        return self.report(ep, Verdict::Failed(e))
                    }
                    // The peer may have pipelined its reply already
                    step = self.protocol.advance(ep.read_buf());
                }
            }
        }
    }
}

impl Handler for ProbeHandler {
    fn on_connect(&mut self, ep: &mut Endpoint) {
        if self.check_cancelled(ep) {
            return
        }

        let step = self.protocol.start();
        self.drive(ep, step);
    }

    fn on_readable(&mut self, ep: &mut Endpoint) {
        if self.reported || self.check_cancelled(ep) {
            return
        }

        let step = self.protocol.advance(ep.read_buf());
        self.drive(ep, step);
    }

    fn on_writable(&mut self, ep: &mut Endpoint) {
        if self.reported || self.check_cancelled(ep) {
            return
        }

        self.protocol.on_flushed();
    }

    fn on_error(&mut self, ep: &mut Endpoint, err: Error) {
        if self.reported || self.check_cancelled(ep) {
            return
        }

        let verdict = match err {
            Error::PeerClosed => self.protocol.on_peer_closed(),
            e => Verdict::Failed(e),
        };
        self.report(ep, verdict);
    }

    fn on_timeout(&mut self, ep: &mut Endpoint) {
        if self.reported || self.check_cancelled(ep) {
            return
        }

        self.report(ep, Verdict::Denied(Error::Timeout));
    }

    fn on_close(&mut self, ep: &Endpoint) {
        if self.reported || self.cancelled.get() {
            return
        }

        // Closed from outside without a verdict
        self.reported = true;
        self.verdicts.borrow_mut().push_back(VerdictEvent {
            job: self.job,
            probe: self.probe,
            verdict: Verdict::Failed(Error::EndpointClosed),
        });
        debug!(target: "probe::handler", "job {} probe of {} closed early", self.job, ep.peer_addr());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{
        net::{Direction, Token},
        probe::socks4::Socks4Probe,
    };

    fn setup() -> (ProbeHandler, Rc<Cell<bool>>, VerdictQueue) {
        let protocol = Socks4Probe::new("192.0.2.10:6667".parse().unwrap(), "").unwrap();
        let cancelled = Rc::new(Cell::new(false));
        let queue = VerdictQueue::default();
        let handler = ProbeHandler::new(7, 1, Box::new(protocol), cancelled.clone(), queue.clone());
        (handler, cancelled, queue)
    }

    fn endpoint() -> Endpoint {
        let addr = "198.51.100.4:1080".parse().unwrap();
        Endpoint::new(Token(3), None, Direction::Outbound, addr, None, Instant::now())
    }

    #[test]
    fn reports_once_and_closes() {
        let (mut handler, _, queue) = setup();
        let mut ep = endpoint();

        handler.on_connect(&mut ep);
        assert_eq!(ep.pending_writes(), 9);

        ep.read_buf().extend(&[0x00, 0x5a]);
        handler.on_readable(&mut ep);
        assert!(!ep.is_open());

        handler.on_timeout(&mut ep);
        handler.on_close(&ep);

        let events: Vec<_> = queue.borrow_mut().drain(..).collect();
        assert_eq!(events, vec![VerdictEvent { job: 7, probe: 1, verdict: Verdict::Confirmed }]);
    }

    #[test]
    fn eof_before_reply_is_denied() {
        let (mut handler, _, queue) = setup();
        let mut ep = endpoint();

        handler.on_connect(&mut ep);
        handler.on_error(&mut ep, Error::PeerClosed);
        assert_eq!(queue.borrow()[0].verdict, Verdict::Denied(Error::PeerClosed));

        let (mut handler, _, queue) = setup();
        let mut ep = endpoint();
        handler.on_error(&mut ep, Error::ConnectFailed("refused".into()));
        assert!(matches!(queue.borrow()[0].verdict, Verdict::Failed(Error::ConnectFailed(_))));
    }

    #[test]
    fn cancelled_probe_stays_silent() {
        let (mut handler, cancelled, queue) = setup();
        let mut ep = endpoint();

        handler.on_connect(&mut ep);
        cancelled.set(true);

        ep.read_buf().extend(&[0x00, 0x5a]);
        handler.on_readable(&mut ep);
        assert!(!ep.is_open());

        handler.on_close(&ep);
        assert!(queue.borrow().is_empty());
    }
}
