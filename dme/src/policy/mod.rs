//! # Summary
//!
//! The four interchangeable mutual exclusion strategies behind one contract.
//! Every policy exposes `begin_request`, `on_peer_message`, and `release`,
//! and carries the same obligation: report `Entry::Granted` exactly once per
//! `begin_request`, and never before the protocol's entry condition holds.
//!
//! Policies are pure protocol bookkeeping: they never touch sockets or the
//! FSM. Outbound traffic goes through the `Cx` outbox, which the engine
//! drains onto the wire after each call; entry decisions travel back as the
//! return value and the engine turns them into FSM transitions. This keeps
//! every policy testable by shuttling payloads between instances in memory.

use crate::config::SiteId;
use crate::error::Error;
use crate::fsm::CsState;
use crate::message::{Algorithm, Payload};

/// The timestamp-ordered broadcast queue (Lamport).
pub mod lamport;

/// The deferred-reply broadcast (Ricart/Agrawala).
pub mod ricart;

/// The dynamic-request-set strategy (Singhal).
pub mod singhal;

/// The token-passing strategy (Suzuki/Kasami).
pub mod suzuki;

/// Whether the local site may enter the critical region right now.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    /// The entry condition holds; the engine must transition to EXECUTING.
    Granted,
    /// Keep waiting; some later message will grant entry.
    Pending,
}

/// Where an outbound payload goes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dest {
    Site(SiteId),
    /// Every peer site except the sender. Never includes the supervisor.
    Broadcast,
}

/// Outbox a policy fills during one handler call; the engine drains it onto
/// the wire afterwards.
#[derive(Default)]
pub struct Cx {
    outbox: Vec<(Dest, Payload)>,
}

impl Cx {
    pub fn new() -> Self {
        Cx::default()
    }

    /// Queues a payload for one site.
    pub fn send(&mut self, dest: SiteId, payload: Payload) {
        self.outbox.push((Dest::Site(dest), payload));
    }

    /// Queues a payload for every other peer site.
    pub fn broadcast(&mut self, payload: Payload) {
        self.outbox.push((Dest::Broadcast, payload));
    }

    /// Hands the queued traffic to the engine.
    pub fn drain(&mut self) -> Vec<(Dest, Payload)> {
        std::mem::take(&mut self.outbox)
    }
}

/// The common capability set of the four algorithms.
pub trait Policy: Send {
    /// Wire tag this policy speaks; foreign payloads are dropped upstream.
    fn algorithm(&self) -> Algorithm;

    /// Starts competing for the critical region. Returns `Granted` when the
    /// entry condition already holds (token in hand, empty ask-set) so the
    /// engine can chain straight into EXECUTING.
    fn begin_request(&mut self, cx: &mut Cx) -> Entry;

    /// Reacts to one peer protocol message. `state` is the local FSM state
    /// at delivery time; peers must keep answering while IDLE or EXECUTING.
    /// The verdict is only meaningful while PENDING.
    fn on_peer_message(&mut self, cx: &mut Cx, state: CsState, payload: &Payload)
        -> Result<Entry, Error>;

    /// Leaves the critical region, settling whatever debts the protocol
    /// accumulated (queued release, deferred replies, token hand-off).
    fn release(&mut self, cx: &mut Cx);

    /// Whether this site currently holds the permission token. Only the
    /// token-passing strategy ever does.
    fn holds_token(&self) -> bool {
        false
    }
}

/// Builds the policy selected at startup. `holds_token` only matters for the
/// token-passing strategy, where exactly one deployed site starts with it.
pub fn build(
    algorithm: Algorithm,
    id: SiteId,
    count: usize,
    holds_token: bool,
) -> Box<dyn Policy> {
    match algorithm {
        Algorithm::Lamport => Box::new(lamport::Lamport::new(id, count)),
        Algorithm::Ricart => Box::new(ricart::Ricart::new(id, count)),
        Algorithm::Suzuki => Box::new(suzuki::Suzuki::new(id, count, holds_token)),
        Algorithm::Singhal => Box::new(singhal::Singhal::new(id, count)),
    }
}
