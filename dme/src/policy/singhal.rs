//! # Summary
//!
//! Dynamic-request-set mutual exclusion. Instead of broadcasting, each site
//! keeps a Requesting Set Ri of sites it must ask before entering and an
//! Information Set Ii of sites whose requests it is deferring. The sets start
//! as a staircase (site i initially asks every lower-numbered site) and grow
//! reciprocally as grants flow: whoever grants a request must be asked by the
//! grantee next time, so early rounds stay cheap and traffic approaches the
//! broadcast algorithms only as contention spreads.
//!
//! A round's entry condition is checked against the ask-set as it stood when
//! the request was issued; sites learned about mid-round are asked starting
//! with the next request.

use log::{debug, trace};

use crate::config::SiteId;
use crate::error::Error;
use crate::fsm::CsState;
use crate::message::{Algorithm, Payload, SubType};
use crate::policy::{Cx, Entry, Policy};
use crate::timestamp::{Request, Timestamp};

pub struct Singhal {
    id: SiteId,
    /// Requesting Set Ri: sites that must be asked on the next request.
    /// Grows monotonically; it never shrinks in this variant.
    asking: Vec<bool>,
    /// Sites asked in the current round whose grant is still outstanding.
    awaiting: Vec<bool>,
    /// Information Set Ii: sites whose REQUEST we are sitting on.
    deferred: Vec<bool>,
    /// Priority baseline for defer decisions while PENDING.
    own: Option<Request>,
}

impl Singhal {
    pub fn new(id: SiteId, count: usize) -> Self {
        let mut asking = vec![false; count + 1];
        // Staircase initialization: site i starts by asking every
        // lower-numbered site, so the lowest site enters for free and every
        // pair of sites is covered by exactly one initial ask direction.
        for site in 1..id {
            asking[site as usize] = true;
        }
        Singhal {
            id,
            asking,
            awaiting: vec![false; count + 1],
            deferred: vec![false; count + 1],
            own: None,
        }
    }

    fn all_granted(&self) -> bool {
        !self.awaiting.iter().any(|waiting| *waiting)
    }

    fn reply_to(&self, cx: &mut Cx, dest: SiteId) {
        cx.send(
            dest,
            Payload::Singhal {
                kind: SubType::Reply,
                request: Request::new(Timestamp::now(), self.id),
            },
        );
    }

    fn verdict(&self, state: CsState) -> Entry {
        if state == CsState::Pending && self.all_granted() {
            Entry::Granted
        } else {
            Entry::Pending
        }
    }
}

impl Policy for Singhal {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Singhal
    }

    fn begin_request(&mut self, cx: &mut Cx) -> Entry {
        let own = Request::new(Timestamp::now(), self.id);
        self.own = Some(own);
        self.awaiting.copy_from_slice(&self.asking);
        if self.all_granted() {
            debug!("requesting set empty; entering immediately");
            return Entry::Granted;
        }
        debug!("requesting with {:?}", own);
        for site in 1..self.awaiting.len() as SiteId {
            if self.awaiting[site as usize] {
                cx.send(
                    site,
                    Payload::Singhal {
                        kind: SubType::Request,
                        request: own,
                    },
                );
            }
        }
        Entry::Pending
    }

    fn on_peer_message(
        &mut self,
        cx: &mut Cx,
        state: CsState,
        payload: &Payload,
    ) -> Result<Entry, Error> {
        let (kind, request) = match payload {
            Payload::Singhal { kind, request } => (*kind, *request),
            other => return Err(Error::ForeignAlgorithm(other.algorithm())),
        };
        if request.site as usize >= self.asking.len() {
            return Err(Error::BadSite(request.site));
        }
        let sender = request.site as usize;
        match (kind, state) {
            (SubType::Request, CsState::Idle) => {
                // Grant now, but ask the sender next time around.
                self.asking[sender] = true;
                self.reply_to(cx, request.site);
            }
            (SubType::Request, CsState::Executing) => {
                trace!("deferring {} while executing", request.site);
                self.deferred[sender] = true;
            }
            (SubType::Request, CsState::Pending) => {
                // Older competitor wins; younger ones wait for our release.
                match self.own {
                    Some(own) if request < own => {
                        self.asking[sender] = true;
                        self.reply_to(cx, request.site);
                    }
                    _ => {
                        trace!("deferring younger request from {}", request.site);
                        self.deferred[sender] = true;
                    }
                }
            }
            (SubType::Reply, _) => {
                trace!("grant from {}", request.site);
                self.awaiting[sender] = false;
            }
            (SubType::Release, _) => return Err(Error::BadSubType(SubType::Release.tag())),
        }
        Ok(self.verdict(state))
    }

    fn release(&mut self, cx: &mut Cx) {
        self.own = None;
        for site in 1..self.deferred.len() as SiteId {
            if self.deferred[site as usize] {
                debug!("settling deferred reply to {}", site);
                self.reply_to(cx, site);
                // A granted site must be asked again next time.
                self.asking[site as usize] = true;
                self.deferred[site as usize] = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Dest;

    fn request(secs: u32, site: SiteId) -> Payload {
        Payload::Singhal {
            kind: SubType::Request,
            request: Request::new(Timestamp::new(secs, 0), site),
        }
    }

    fn reply(site: SiteId) -> Payload {
        Payload::Singhal {
            kind: SubType::Reply,
            request: Request::new(Timestamp::new(0, 0), site),
        }
    }

    fn sent_to(cx: &mut Cx, kind: SubType) -> Vec<SiteId> {
        cx.drain()
            .into_iter()
            .filter(|(_, payload)| payload.kind() == kind)
            .map(|(dest, _)| match dest {
                Dest::Site(site) => site,
                Dest::Broadcast => unreachable!("this policy never broadcasts"),
            })
            .collect()
    }

    #[test]
    fn staircase_lets_the_lowest_site_enter_for_free() {
        let mut lowest = Singhal::new(1, 3);
        let mut cx = Cx::new();
        assert_eq!(lowest.begin_request(&mut cx), Entry::Granted);
        assert!(cx.drain().is_empty());
    }

    #[test]
    fn requests_go_only_to_the_requesting_set() {
        let mut policy = Singhal::new(3, 3);
        let mut cx = Cx::new();
        assert_eq!(policy.begin_request(&mut cx), Entry::Pending);
        let mut asked = sent_to(&mut cx, SubType::Request);
        asked.sort_unstable();
        assert_eq!(asked, vec![1, 2]);
    }

    #[test]
    fn idle_grant_grows_the_requesting_set() {
        let mut policy = Singhal::new(1, 3);
        let mut cx = Cx::new();
        policy
            .on_peer_message(&mut cx, CsState::Idle, &request(5, 3))
            .unwrap();
        assert_eq!(sent_to(&mut cx, SubType::Reply), vec![3]);
        assert!(policy.asking[3]);
        // The next request must now ask site 3.
        policy.begin_request(&mut cx);
        assert_eq!(sent_to(&mut cx, SubType::Request), vec![3]);
    }

    #[test]
    fn entry_condition_is_a_fully_granted_round() {
        let mut policy = Singhal::new(3, 3);
        let mut cx = Cx::new();
        policy.begin_request(&mut cx);
        cx.drain();
        let verdict = policy
            .on_peer_message(&mut cx, CsState::Pending, &reply(1))
            .unwrap();
        assert_eq!(verdict, Entry::Pending);
        let verdict = policy
            .on_peer_message(&mut cx, CsState::Pending, &reply(2))
            .unwrap();
        assert_eq!(verdict, Entry::Granted);
    }

    #[test]
    fn pending_sites_grant_older_requests_and_defer_younger_ones() {
        let mut policy = Singhal::new(2, 3);
        let mut cx = Cx::new();
        policy.begin_request(&mut cx);
        cx.drain();
        // Older than any live clock reading: granted and added to the set.
        policy
            .on_peer_message(&mut cx, CsState::Pending, &request(0, 1))
            .unwrap();
        assert_eq!(sent_to(&mut cx, SubType::Reply), vec![1]);
        assert!(policy.asking[1]);
        // Far in the future: younger, deferred until release.
        policy
            .on_peer_message(&mut cx, CsState::Pending, &request(u32::MAX, 3))
            .unwrap();
        assert!(sent_to(&mut cx, SubType::Reply).is_empty());
        assert!(policy.deferred[3]);
    }

    #[test]
    fn sites_learned_mid_round_do_not_block_the_current_round() {
        let mut policy = Singhal::new(2, 3);
        let mut cx = Cx::new();
        policy.begin_request(&mut cx);
        cx.drain();
        // Granting a senior request adds the sender to the ask-set but the
        // current round still only waits on site 1.
        policy
            .on_peer_message(&mut cx, CsState::Pending, &request(0, 3))
            .unwrap();
        let verdict = policy
            .on_peer_message(&mut cx, CsState::Pending, &reply(1))
            .unwrap();
        assert_eq!(verdict, Entry::Granted);
    }

    #[test]
    fn release_moves_deferred_sites_into_the_requesting_set() {
        let mut policy = Singhal::new(1, 3);
        let mut cx = Cx::new();
        policy
            .on_peer_message(&mut cx, CsState::Executing, &request(1, 2))
            .unwrap();
        policy
            .on_peer_message(&mut cx, CsState::Executing, &request(2, 3))
            .unwrap();
        cx.drain();
        policy.release(&mut cx);
        let mut granted = sent_to(&mut cx, SubType::Reply);
        granted.sort_unstable();
        assert_eq!(granted, vec![2, 3]);
        assert!(policy.asking[2] && policy.asking[3]);
        assert!(!policy.deferred[2] && !policy.deferred[3]);
    }
}
