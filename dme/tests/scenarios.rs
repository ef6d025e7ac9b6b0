//! End-to-end protocol scenarios: several policy instances wired through the
//! real codec with an in-memory wire, checking that exactly one site occupies
//! the critical region at a time and that entry order follows each
//! algorithm's rules.

use std::collections::VecDeque;

use dme::fsm::CsState;
use dme::message::PeerMessage;
use dme::policy::{self, Cx, Dest, Entry, Policy};
use dme::{Algorithm, SiteId};

struct Site {
    state: CsState,
    policy: Box<dyn Policy>,
    cx: Cx,
}

/// A fleet of policy instances exchanging encoded datagrams in FIFO order.
/// The mutual exclusion invariant is checked after every delivery.
struct Sim {
    algorithm: Algorithm,
    sites: Vec<Site>,
    wire: VecDeque<(SiteId, Vec<u8>)>,
}

impl Sim {
    fn new(algorithm: Algorithm, count: usize) -> Self {
        let sites = (0..=count as SiteId)
            .map(|id| Site {
                state: CsState::Idle,
                // Site 1 starts as the token holder by convention.
                policy: policy::build(algorithm, id, count, id == 1),
                cx: Cx::new(),
            })
            .collect();
        Sim {
            algorithm,
            sites,
            wire: VecDeque::new(),
        }
    }

    fn state(&self, site: SiteId) -> CsState {
        self.sites[site as usize].state
    }

    fn executing(&self) -> Vec<SiteId> {
        (1..self.sites.len() as SiteId)
            .filter(|site| self.state(*site) == CsState::Executing)
            .collect()
    }

    fn token_holders(&self) -> Vec<SiteId> {
        (1..self.sites.len() as SiteId)
            .filter(|site| self.sites[*site as usize].policy.holds_token())
            .collect()
    }

    fn check_safety(&self) {
        assert!(
            self.executing().len() <= 1,
            "more than one site in the critical region: {:?}",
            self.executing()
        );
        // At most one copy of the token exists; it may be in flight.
        assert!(
            self.token_holders().len() <= 1,
            "the token was duplicated: {:?}",
            self.token_holders()
        );
    }

    /// Drains a site's outbox onto the wire as encoded datagrams.
    fn route(&mut self, from: SiteId) {
        let count = self.sites.len() as SiteId;
        let outbox = self.sites[from as usize].cx.drain();
        for (dest, payload) in outbox {
            let datagram = PeerMessage::new(from, payload).encode();
            match dest {
                Dest::Site(to) => self.wire.push_back((to, datagram)),
                Dest::Broadcast => {
                    for to in (1..count).filter(|to| *to != from) {
                        self.wire.push_back((to, datagram.clone()));
                    }
                }
            }
        }
    }

    fn settle(&mut self, site: SiteId, verdict: Entry) {
        let slot = &mut self.sites[site as usize];
        if slot.state == CsState::Pending && verdict == Entry::Granted {
            slot.state = CsState::Executing;
        }
        self.route(site);
        self.check_safety();
    }

    /// The supervisor prompted this site; it starts competing.
    fn want(&mut self, site: SiteId) {
        let slot = &mut self.sites[site as usize];
        assert_eq!(slot.state, CsState::Idle);
        slot.state = CsState::Pending;
        let verdict = slot.policy.begin_request(&mut slot.cx);
        self.settle(site, verdict);
    }

    /// The simulated work timer expired; the site leaves the region.
    fn exit(&mut self, site: SiteId) {
        let slot = &mut self.sites[site as usize];
        assert_eq!(slot.state, CsState::Executing);
        slot.state = CsState::Idle;
        slot.policy.release(&mut slot.cx);
        self.route(site);
        self.check_safety();
    }

    /// Delivers every in-flight datagram, including those generated along
    /// the way, in FIFO order.
    fn deliver_all(&mut self) {
        while let Some((to, datagram)) = self.wire.pop_front() {
            let message = PeerMessage::decode(&datagram).expect("well-formed datagram");
            let slot = &mut self.sites[to as usize];
            let verdict = slot
                .policy
                .on_peer_message(&mut slot.cx, slot.state, &message.payload)
                .expect("protocol message accepted");
            self.settle(to, verdict);
        }
        // Once the wire is quiet the token must be parked at exactly one
        // site; anything else means it was lost or duplicated in transit.
        if self.algorithm == Algorithm::Suzuki {
            assert_eq!(
                self.token_holders().len(),
                1,
                "token not at exactly one site: {:?}",
                self.token_holders()
            );
        }
    }

    /// Drives one full want-enter-exit cycle for one site, alone.
    fn cycle(&mut self, site: SiteId) {
        self.want(site);
        self.deliver_all();
        assert_eq!(self.executing(), vec![site]);
        self.exit(site);
        self.deliver_all();
    }
}

#[test]
fn lamport_grants_in_timestamp_order() {
    let mut sim = Sim::new(Algorithm::Lamport, 3);
    // Site 2 asks first; its timestamp is older (ties break toward the
    // smaller id), so it must win the contention.
    sim.want(2);
    sim.want(3);
    sim.deliver_all();
    assert_eq!(sim.executing(), vec![2]);
    assert_eq!(sim.state(3), CsState::Pending);
    sim.exit(2);
    sim.deliver_all();
    assert_eq!(sim.executing(), vec![3]);
    sim.exit(3);
    sim.deliver_all();
    assert!(sim.executing().is_empty());
}

#[test]
fn lamport_cycles_many_sites_in_request_order() {
    let mut sim = Sim::new(Algorithm::Lamport, 5);
    for site in 1..=5 {
        sim.want(site);
    }
    sim.deliver_all();
    // All five compete; they must enter one at a time in timestamp order.
    for site in 1..=5 {
        assert_eq!(sim.executing(), vec![site]);
        sim.exit(site);
        sim.deliver_all();
    }
    assert!(sim.executing().is_empty());
}

#[test]
fn ricart_defers_while_executing_and_settles_on_release() {
    let mut sim = Sim::new(Algorithm::Ricart, 3);
    sim.want(1);
    sim.deliver_all();
    assert_eq!(sim.executing(), vec![1]);
    // Both latecomers are deferred by the occupant; between themselves the
    // older request is granted first.
    sim.want(2);
    sim.want(3);
    sim.deliver_all();
    assert_eq!(sim.executing(), vec![1]);
    sim.exit(1);
    sim.deliver_all();
    assert_eq!(sim.executing(), vec![2]);
    sim.exit(2);
    sim.deliver_all();
    assert_eq!(sim.executing(), vec![3]);
    sim.exit(3);
    sim.deliver_all();
    assert!(sim.executing().is_empty());
}

#[test]
fn suzuki_idle_holder_forwards_the_token() {
    let mut sim = Sim::new(Algorithm::Suzuki, 2);
    // Site 1 holds the token but is idle; site 2's request must pull the
    // token over without site 1 ever competing.
    sim.want(2);
    sim.deliver_all();
    assert_eq!(sim.executing(), vec![2]);
    sim.exit(2);
    sim.deliver_all();
    // The token stays at site 2 until someone asks again.
    sim.cycle(2);
    sim.cycle(1);
}

#[test]
fn suzuki_token_circulates_under_contention() {
    let mut sim = Sim::new(Algorithm::Suzuki, 4);
    sim.want(1);
    sim.deliver_all();
    assert_eq!(sim.executing(), vec![1]);
    for site in 2..=4 {
        sim.want(site);
    }
    sim.deliver_all();
    // The holder keeps executing; the waiters queue on the token.
    assert_eq!(sim.executing(), vec![1]);
    sim.exit(1);
    sim.deliver_all();
    // Hand-offs follow the token queue until everyone has been served.
    let mut served = Vec::new();
    while let Some(site) = sim.executing().first().copied() {
        served.push(site);
        sim.exit(site);
        sim.deliver_all();
    }
    served.sort_unstable();
    assert_eq!(served, vec![2, 3, 4]);
}

#[test]
fn singhal_staircase_lets_site_one_enter_for_free() {
    let mut sim = Sim::new(Algorithm::Singhal, 3);
    sim.want(1);
    assert_eq!(sim.executing(), vec![1]);
    sim.exit(1);
    sim.deliver_all();
    // Site 3 starts by asking both lower sites.
    sim.cycle(3);
    // Having granted site 3, site 1 now needs its permission too.
    sim.cycle(1);
}

#[test]
fn singhal_contention_grants_the_older_request_first() {
    let mut sim = Sim::new(Algorithm::Singhal, 3);
    // Site 2 asks first, so its request is senior; site 3's junior request
    // is deferred by site 2 until release.
    sim.want(2);
    sim.want(3);
    sim.deliver_all();
    assert_eq!(sim.executing(), vec![2]);
    assert_eq!(sim.state(3), CsState::Pending);
    sim.exit(2);
    sim.deliver_all();
    assert_eq!(sim.executing(), vec![3]);
    sim.exit(3);
    sim.deliver_all();
    assert!(sim.executing().is_empty());
}
