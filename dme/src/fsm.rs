//! # Summary
//!
//! The per-site engine: a three-state machine (IDLE, PENDING, EXECUTING)
//! wrapping the active algorithm policy. The supervisor prompts an idle site
//! into PENDING; the policy decides when PENDING becomes EXECUTING; a timer
//! simulating the critical-region work drives EXECUTING back to IDLE. Every
//! transition out of order is a fatal error, since it means protocol state
//! has already been corrupted.
//!
//! The engine owns the boundary between the serialized event world and the
//! wire: it demultiplexes raw datagrams by magic, drains each policy's outbox
//! onto the transport, and reports entry latency and occupancy back to the
//! supervisor.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::{Config, SUPERVISOR_ID};
use crate::error::Error;
use crate::event::{EventKind, Reactor};
use crate::message::{self, PeerMessage, SupKind, SupMessage};
use crate::net::Net;
use crate::policy::{Cx, Dest, Entry, Policy};
use crate::timestamp::Timestamp;

/// The local site's relationship to the critical region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CsState {
    Idle,
    Pending,
    Executing,
}

/// One site's engine: FSM, policy, transport, and supervisor bookkeeping.
pub struct Peer {
    config: Config,
    state: CsState,
    policy: Box<dyn Policy>,
    net: Box<dyn Net>,
    cx: Cx,
    /// Baseline for the elapsed-time deltas reported to the supervisor.
    contact: Instant,
    /// Simulated occupancy requested by the last supervisor prompt.
    work: Duration,
    /// Datagrams discarded for failing the decode contract.
    malformed: u64,
}

impl Peer {
    pub fn new(config: Config, policy: Box<dyn Policy>, net: Box<dyn Net>) -> Self {
        Peer {
            config,
            state: CsState::Idle,
            policy,
            net,
            cx: Cx::new(),
            contact: Instant::now(),
            work: Duration::ZERO,
            malformed: 0,
        }
    }

    /// Wires the engine's handlers into the dispatch loop.
    pub fn bind(reactor: &mut Reactor<Peer>) -> Result<(), Error> {
        reactor.register_internal(EventKind::PacketIn, demux);
        reactor.register(EventKind::PeerMessage, on_peer_message)?;
        reactor.register(EventKind::SupervisorMessage, on_supervisor_message)?;
        reactor.register(EventKind::WantCriticalRegion, on_want_critical_region)?;
        reactor.register(EventKind::EnteredCriticalRegion, on_entered_critical_region)?;
        reactor.register(EventKind::ExitedCriticalRegion, on_exited_critical_region)?;
        Ok(())
    }

    pub fn state(&self) -> CsState {
        self.state
    }

    /// Count of datagrams dropped by the decode contract.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Drains the policy outbox onto the wire.
    fn flush(&mut self) -> Result<(), Error> {
        for (dest, payload) in self.cx.drain() {
            let wire = PeerMessage::new(self.config.id(), payload).encode();
            match dest {
                Dest::Site(site) => self.net.send(site, &wire)?,
                Dest::Broadcast => self.net.broadcast(&wire)?,
            }
        }
        Ok(())
    }

    /// Reports an elapsed-time delta to the supervisor and resets the
    /// baseline, so entry latency and occupancy come out as separate spans.
    fn report(&mut self, kind: SupKind) -> Result<(), Error> {
        let elapsed = self.contact.elapsed();
        self.contact = Instant::now();
        let wire = SupMessage::new(self.config.id(), kind, Timestamp::from(elapsed)).encode();
        self.net.send(SUPERVISOR_ID, &wire)
    }

    fn guard(&self, event: EventKind, expected: CsState) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::BadTransition(event, self.state));
        }
        Ok(())
    }
}

/// Routes a raw datagram by its leading magic. Anything that fails the
/// decode contract is counted, reported, and dropped.
fn demux(peer: &mut Peer, reactor: &mut Reactor<Peer>, cookie: Option<Vec<u8>>) -> Result<(), Error> {
    let datagram = cookie.ok_or(Error::ShortDatagram(0))?;
    let kind = match message::peek_magic(&datagram) {
        Ok(message::PEER_MAGIC) => EventKind::PeerMessage,
        Ok(message::SUP_MAGIC) => EventKind::SupervisorMessage,
        Ok(magic) => {
            peer.malformed += 1;
            return Err(Error::BadMagic(magic));
        }
        Err(err) => {
            peer.malformed += 1;
            return Err(err);
        }
    };
    reactor.dispatch_now(peer, kind, Some(datagram))
}

/// Hands a peer protocol message to the active policy, in every FSM state:
/// sites keep answering others' requests while idle or executing.
fn on_peer_message(
    peer: &mut Peer,
    reactor: &mut Reactor<Peer>,
    cookie: Option<Vec<u8>>,
) -> Result<(), Error> {
    let datagram = cookie.ok_or(Error::ShortDatagram(0))?;
    let message = match PeerMessage::decode(&datagram) {
        Ok(message) => message,
        Err(err) => {
            peer.malformed += 1;
            return Err(err);
        }
    };
    if message.payload.algorithm() != peer.policy.algorithm() {
        peer.malformed += 1;
        return Err(Error::ForeignAlgorithm(message.payload.algorithm()));
    }
    let verdict = peer
        .policy
        .on_peer_message(&mut peer.cx, peer.state, &message.payload)?;
    peer.flush()?;
    if peer.state == CsState::Pending && verdict == Entry::Granted {
        return reactor.dispatch_now(peer, EventKind::EnteredCriticalRegion, None);
    }
    Ok(())
}

/// A supervisor prompt. Only an idle site starts competing; a prompt to a
/// site already PENDING or EXECUTING is logged and ignored.
fn on_supervisor_message(
    peer: &mut Peer,
    reactor: &mut Reactor<Peer>,
    cookie: Option<Vec<u8>>,
) -> Result<(), Error> {
    let datagram = cookie.ok_or(Error::ShortDatagram(0))?;
    let message = match SupMessage::decode(&datagram) {
        Ok(message) => message,
        Err(err) => {
            peer.malformed += 1;
            return Err(err);
        }
    };
    if message.kind != SupKind::WantCs {
        warn!("unexpected supervisor report {:?} at a peer", message.kind);
        return Ok(());
    }
    if peer.state != CsState::Idle {
        info!("supervisor prompt ignored while {:?}", peer.state);
        return Ok(());
    }
    peer.contact = Instant::now();
    peer.work = message.delta.as_duration();
    reactor.dispatch_now(peer, EventKind::WantCriticalRegion, None)
}

/// IDLE -> PENDING. Starts the active policy's request procedure.
fn on_want_critical_region(
    peer: &mut Peer,
    reactor: &mut Reactor<Peer>,
    _: Option<Vec<u8>>,
) -> Result<(), Error> {
    peer.guard(EventKind::WantCriticalRegion, CsState::Idle)?;
    debug!("site {} now PENDING", peer.config.id());
    peer.state = CsState::Pending;
    let verdict = peer.policy.begin_request(&mut peer.cx);
    peer.flush()?;
    if verdict == Entry::Granted {
        return reactor.dispatch_now(peer, EventKind::EnteredCriticalRegion, None);
    }
    Ok(())
}

/// PENDING -> EXECUTING. Reports entry latency and arms the work timer.
fn on_entered_critical_region(
    peer: &mut Peer,
    reactor: &mut Reactor<Peer>,
    _: Option<Vec<u8>>,
) -> Result<(), Error> {
    peer.guard(EventKind::EnteredCriticalRegion, CsState::Pending)?;
    debug!("site {} now EXECUTING for {:?}", peer.config.id(), peer.work);
    peer.state = CsState::Executing;
    // The work timer is what gets the site back out of EXECUTING; it must be
    // armed even when the supervisor report cannot be sent right now.
    reactor.schedule(EventKind::ExitedCriticalRegion, None, peer.work)?;
    if let Err(err) = peer.report(SupKind::EnteredCs) {
        warn!("entry report to the supervisor failed: {}", err);
    }
    Ok(())
}

/// EXECUTING -> IDLE. Reports occupancy and settles the policy's debts.
fn on_exited_critical_region(
    peer: &mut Peer,
    _: &mut Reactor<Peer>,
    _: Option<Vec<u8>>,
) -> Result<(), Error> {
    peer.guard(EventKind::ExitedCriticalRegion, CsState::Executing)?;
    debug!("site {} back to IDLE", peer.config.id());
    peer.state = CsState::Idle;
    // Peers blocked on our release must hear about it even when the
    // supervisor report cannot be sent right now.
    if let Err(err) = peer.report(SupKind::ExitedCs) {
        warn!("exit report to the supervisor failed: {}", err);
    }
    peer.policy.release(&mut peer.cx);
    peer.flush()
}
