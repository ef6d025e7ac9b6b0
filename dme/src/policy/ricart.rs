//! # Summary
//!
//! Deferred-reply broadcast mutual exclusion. There is no explicit queue:
//! a site enters once every peer has replied to its request. Permission is
//! withheld (deferred) from younger competitors and from everyone while
//! executing; the deferred replies are settled on release.

use log::{debug, trace};

use crate::config::SiteId;
use crate::error::Error;
use crate::fsm::CsState;
use crate::message::{Algorithm, Payload, SubType};
use crate::policy::{Cx, Entry, Policy};
use crate::timestamp::{Request, Timestamp};

pub struct Ricart {
    id: SiteId,
    /// Reply Set, indexed by site id; meaningful only while PENDING.
    replies: Vec<bool>,
    /// Sites whose REQUEST we are sitting on until release.
    deferred: Vec<bool>,
    /// Our own outstanding request, the baseline for defer decisions.
    own: Option<Request>,
}

impl Ricart {
    pub fn new(id: SiteId, count: usize) -> Self {
        Ricart {
            id,
            replies: vec![false; count + 1],
            deferred: vec![false; count + 1],
            own: None,
        }
    }

    fn all_replied(&self) -> bool {
        (1..self.replies.len() as SiteId)
            .filter(|site| *site != self.id)
            .all(|site| self.replies[site as usize])
    }

    fn reply_to(&self, cx: &mut Cx, dest: SiteId) {
        cx.send(
            dest,
            Payload::Ricart {
                kind: SubType::Reply,
                request: Request::new(Timestamp::now(), self.id),
            },
        );
    }

    fn verdict(&self, state: CsState) -> Entry {
        if state == CsState::Pending && self.all_replied() {
            Entry::Granted
        } else {
            Entry::Pending
        }
    }
}

impl Policy for Ricart {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Ricart
    }

    fn begin_request(&mut self, cx: &mut Cx) -> Entry {
        let own = Request::new(Timestamp::now(), self.id);
        self.replies.fill(false);
        self.own = Some(own);
        debug!("requesting with {:?}", own);
        cx.broadcast(Payload::Ricart {
            kind: SubType::Request,
            request: own,
        });
        self.verdict(CsState::Pending)
    }

    fn on_peer_message(
        &mut self,
        cx: &mut Cx,
        state: CsState,
        payload: &Payload,
    ) -> Result<Entry, Error> {
        let (kind, request) = match payload {
            Payload::Ricart { kind, request } => (*kind, *request),
            other => return Err(Error::ForeignAlgorithm(other.algorithm())),
        };
        if request.site as usize >= self.replies.len() {
            return Err(Error::BadSite(request.site));
        }
        match (kind, state) {
            (SubType::Request, CsState::Idle) => self.reply_to(cx, request.site),
            (SubType::Request, CsState::Executing) => {
                trace!("deferring {} while executing", request.site);
                self.deferred[request.site as usize] = true;
            }
            (SubType::Request, CsState::Pending) => {
                // Older competitor wins; younger ones wait for our release.
                match self.own {
                    Some(own) if request < own => self.reply_to(cx, request.site),
                    _ => {
                        trace!("deferring younger request from {}", request.site);
                        self.deferred[request.site as usize] = true;
                    }
                }
            }
            (SubType::Reply, _) => {
                trace!("reply from {}", request.site);
                self.replies[request.site as usize] = true;
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
                self.deferred[site as usize] = false;
            }
        }
    }
}
