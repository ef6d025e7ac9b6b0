//! # Summary
//!
//! The external driver of the simulation. The supervisor never competes for
//! the critical region; it keeps the only cross-site state table (last
//! reported CS state per site, authoritative here and nowhere else), elects
//! contenders when the region is quiet, and accumulates latency and occupancy
//! statistics from the peers' reports.
//!
//! Everything runs inside the same serialized dispatch loop the peers use:
//! a periodic tick drives elections and inbound reports update the table.

use std::time::Duration;

use log::{debug, error, info, warn};
use rand::prelude::*;

use crate::config::{Config, SiteId};
use crate::error::Error;
use crate::event::{EventKind, Reactor};
use crate::fsm::CsState;
use crate::message::{self, SupKind, SupMessage};
use crate::net::Net;
use crate::timestamp::Timestamp;

/// Running totals over all reports received so far.
#[derive(Copy, Clone, Debug, Default)]
pub struct Stats {
    /// WANT_CS prompts sent.
    pub prompts: u64,
    /// ENTERED_CS reports received, with their summed entry latency.
    pub entries: u64,
    pub total_latency: Duration,
    /// EXITED_CS reports received, with their summed occupancy.
    pub exits: u64,
    pub total_occupancy: Duration,
}

/// Supervisor context driven by the dispatch loop.
pub struct Supervisor {
    config: Config,
    net: Box<dyn Net>,
    /// Last reported state per site, indexed by site id (entry 0 unused).
    states: Vec<CsState>,
    /// Delay between election ticks.
    period: Duration,
    /// Simulated work span handed to elected sites.
    occupancy: Duration,
    stats: Stats,
    /// Times more than one site reported EXECUTING at once.
    violations: u64,
    malformed: u64,
}

impl Supervisor {
    pub fn new(config: Config, net: Box<dyn Net>, period: Duration, occupancy: Duration) -> Self {
        let states = vec![CsState::Idle; config.count() + 1];
        Supervisor {
            config,
            net,
            states,
            period,
            occupancy,
            stats: Stats::default(),
            violations: 0,
            malformed: 0,
        }
    }

    /// Wires the driver's handlers and posts the first election tick.
    pub fn bind(reactor: &mut Reactor<Supervisor>) -> Result<(), Error> {
        reactor.register_internal(EventKind::PacketIn, demux);
        reactor.register(EventKind::SupervisorMessage, on_report)?;
        reactor.register(EventKind::PeriodicWork, on_tick)?;
        reactor.post(EventKind::PeriodicWork, None);
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Times the state table showed two sites executing at once.
    pub fn violations(&self) -> u64 {
        self.violations
    }

    pub fn state_of(&self, site: SiteId) -> CsState {
        self.states[site as usize]
    }

    fn quiet(&self) -> bool {
        self.states[1..]
            .iter()
            .all(|state| *state == CsState::Idle)
    }

    fn executing(&self) -> Option<SiteId> {
        self.states[1..]
            .iter()
            .position(|state| *state == CsState::Executing)
            .map(|ix| ix as SiteId + 1)
    }

    fn prompt(&mut self, site: SiteId) -> Result<(), Error> {
        let wire = SupMessage::new(
            self.config.id(),
            SupKind::WantCs,
            Timestamp::from(self.occupancy),
        )
        .encode();
        self.net.send(site, &wire)?;
        self.states[site as usize] = CsState::Pending;
        self.stats.prompts += 1;
        Ok(())
    }

    /// Picks a random non-empty subset of sites to compete for the region.
    fn elect(&mut self) -> Result<(), Error> {
        let count = self.config.count();
        let mut rng = rand::thread_rng();
        let amount = rng.gen_range(1..=count);
        let chosen = (1..=count as SiteId).choose_multiple(&mut rng, amount);
        info!("electing {:?} to compete", chosen);
        for site in chosen {
            self.prompt(site)?;
        }
        Ok(())
    }
}

/// The supervisor only understands its own datagram family; peer protocol
/// traffic arriving here means a misconfigured topology.
fn demux(
    sup: &mut Supervisor,
    reactor: &mut Reactor<Supervisor>,
    cookie: Option<Vec<u8>>,
) -> Result<(), Error> {
    let datagram = cookie.ok_or(Error::ShortDatagram(0))?;
    match message::peek_magic(&datagram) {
        Ok(message::SUP_MAGIC) => {
            reactor.dispatch_now(sup, EventKind::SupervisorMessage, Some(datagram))
        }
        Ok(message::PEER_MAGIC) => {
            warn!("peer protocol traffic at the supervisor; check the topology file");
            Ok(())
        }
        Ok(magic) => {
            sup.malformed += 1;
            Err(Error::BadMagic(magic))
        }
        Err(err) => {
            sup.malformed += 1;
            Err(err)
        }
    }
}

/// Updates the state table and the running statistics from a peer report.
fn on_report(
    sup: &mut Supervisor,
    _: &mut Reactor<Supervisor>,
    cookie: Option<Vec<u8>>,
) -> Result<(), Error> {
    let datagram = cookie.ok_or(Error::ShortDatagram(0))?;
    let report = match SupMessage::decode(&datagram) {
        Ok(report) => report,
        Err(err) => {
            sup.malformed += 1;
            return Err(err);
        }
    };
    if report.site as usize >= sup.states.len() {
        return Err(Error::BadSite(report.site));
    }
    match report.kind {
        SupKind::EnteredCs => {
            if let Some(other) = sup.executing() {
                error!(
                    "mutual exclusion violated: site {} entered while site {} is executing",
                    report.site, other
                );
                sup.violations += 1;
            }
            debug!(
                "site {} entered after {:?}",
                report.site,
                report.delta.as_duration()
            );
            sup.states[report.site as usize] = CsState::Executing;
            sup.stats.entries += 1;
            sup.stats.total_latency += report.delta.as_duration();
        }
        SupKind::ExitedCs => {
            debug!(
                "site {} exited after {:?}",
                report.site,
                report.delta.as_duration()
            );
            sup.states[report.site as usize] = CsState::Idle;
            sup.stats.exits += 1;
            sup.stats.total_occupancy += report.delta.as_duration();
        }
        SupKind::WantCs => {
            warn!("WANT_CS prompt echoed back from site {}", report.site);
        }
    }
    Ok(())
}

/// Periodic election tick. New contenders are elected only while the whole
/// region is quiet, then the tick reschedules itself.
fn on_tick(
    sup: &mut Supervisor,
    reactor: &mut Reactor<Supervisor>,
    _: Option<Vec<u8>>,
) -> Result<(), Error> {
    if sup.quiet() {
        sup.elect()?;
    } else {
        debug!("sites still competing; skipping election");
    }
    reactor.schedule(EventKind::PeriodicWork, None, sup.period)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::{Site, SUPERVISOR_ID};

    #[derive(Clone, Default)]
    struct RecordingNet {
        sent: Arc<Mutex<Vec<(SiteId, Vec<u8>)>>>,
    }

    impl RecordingNet {
        fn prompts(&self) -> Vec<(SiteId, SupMessage)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(to, wire)| (*to, SupMessage::decode(wire).unwrap()))
                .collect()
        }
    }

    impl Net for RecordingNet {
        fn send(&self, dest: SiteId, datagram: &[u8]) -> Result<(), Error> {
            self.sent.lock().unwrap().push((dest, datagram.to_vec()));
            Ok(())
        }

        fn broadcast(&self, _: &[u8]) -> Result<(), Error> {
            unreachable!("the supervisor only prompts individual sites")
        }
    }

    fn driver(peers: usize) -> (Supervisor, Reactor<Supervisor>, RecordingNet) {
        let sites = (0..=peers as SiteId)
            .map(|id| Site {
                id,
                addr: format!("127.0.0.1:{}", 9100 + id).parse().unwrap(),
                link_speed: 1_000_000,
            })
            .collect();
        let config = Config::from_sites(SUPERVISOR_ID, sites).unwrap();
        let net = RecordingNet::default();
        let sup = Supervisor::new(
            config,
            Box::new(net.clone()),
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        let mut reactor = Reactor::new();
        Supervisor::bind(&mut reactor).unwrap();
        (sup, reactor, net)
    }

    fn report(site: SiteId, kind: SupKind, delta: Duration) -> Vec<u8> {
        SupMessage::new(site, kind, Timestamp::from(delta)).encode()
    }

    #[tokio::test]
    async fn quiet_region_elects_a_nonempty_subset() {
        let (mut sup, mut reactor, net) = driver(4);
        reactor
            .dispatch_now(&mut sup, EventKind::PeriodicWork, None)
            .unwrap();
        let prompts = net.prompts();
        assert!(!prompts.is_empty() && prompts.len() <= 4);
        for (site, message) in prompts {
            assert_eq!(message.kind, SupKind::WantCs);
            assert_eq!(message.delta.as_duration(), Duration::from_secs(1));
            assert_eq!(sup.state_of(site), CsState::Pending);
        }
        assert_eq!(reactor.armed_timers(), 1);
    }

    #[tokio::test]
    async fn no_election_while_sites_compete() {
        let (mut sup, mut reactor, net) = driver(3);
        reactor
            .dispatch_now(&mut sup, EventKind::PeriodicWork, None)
            .unwrap();
        let prompted = net.prompts().len();
        reactor
            .dispatch_now(&mut sup, EventKind::PeriodicWork, None)
            .unwrap();
        assert_eq!(net.prompts().len(), prompted);
    }

    #[tokio::test]
    async fn reports_update_table_and_statistics() {
        let (mut sup, mut reactor, _) = driver(3);
        reactor
            .dispatch_now(
                &mut sup,
                EventKind::PacketIn,
                Some(report(2, SupKind::EnteredCs, Duration::from_millis(30))),
            )
            .unwrap();
        assert_eq!(sup.state_of(2), CsState::Executing);
        reactor
            .dispatch_now(
                &mut sup,
                EventKind::PacketIn,
                Some(report(2, SupKind::ExitedCs, Duration::from_secs(1))),
            )
            .unwrap();
        assert_eq!(sup.state_of(2), CsState::Idle);
        let stats = sup.stats();
        assert_eq!((stats.entries, stats.exits), (1, 1));
        assert_eq!(stats.total_latency, Duration::from_millis(30));
        assert_eq!(stats.total_occupancy, Duration::from_secs(1));
        assert_eq!(sup.violations(), 0);
    }

    #[tokio::test]
    async fn concurrent_executing_reports_are_flagged() {
        let (mut sup, mut reactor, _) = driver(3);
        for site in [1, 2] {
            reactor
                .dispatch_now(
                    &mut sup,
                    EventKind::PacketIn,
                    Some(report(site, SupKind::EnteredCs, Duration::ZERO)),
                )
                .unwrap();
        }
        assert_eq!(sup.violations(), 1);
    }

    #[tokio::test]
    async fn garbage_is_counted_and_dropped() {
        let (mut sup, mut reactor, _) = driver(2);
        let err = reactor
            .dispatch_now(
                &mut sup,
                EventKind::PacketIn,
                Some(vec![0xDE, 0xAD, 0xBE, 0xEF]),
            )
            .unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(sup.malformed, 1);
    }
}
