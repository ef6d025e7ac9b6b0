//! # Summary
//!
//! Timestamp-ordered broadcast mutual exclusion. Every site keeps a request
//! queue sorted by the global request order; a REQUEST is answered with an
//! immediate REPLY and queued, a RELEASE pops the sender's entry. The local
//! site may enter once every peer has replied to its request *and* its own
//! request sits at the head of the queue.

use log::{debug, trace};

use crate::config::SiteId;
use crate::error::Error;
use crate::fsm::CsState;
use crate::message::{Algorithm, Payload, SubType};
use crate::policy::{Cx, Entry, Policy};
use crate::timestamp::{Request, Timestamp};

pub struct Lamport {
    id: SiteId,
    /// Reply Set, indexed by site id; meaningful only while PENDING.
    replies: Vec<bool>,
    /// Request queue, kept sorted ascending by the request total order.
    queue: Vec<Request>,
    /// Our own outstanding request, also present in `queue` while PENDING.
    own: Option<Request>,
}

impl Lamport {
    pub fn new(id: SiteId, count: usize) -> Self {
        Lamport {
            id,
            replies: vec![false; count + 1],
            queue: Vec::new(),
            own: None,
        }
    }

    fn insert(&mut self, request: Request) {
        let ix = self.queue.partition_point(|queued| queued < &request);
        self.queue.insert(ix, request);
        trace!("queue head is now {:?}", self.queue.first());
    }

    fn remove(&mut self, site: SiteId) {
        if let Some(ix) = self.queue.iter().position(|queued| queued.site == site) {
            self.queue.remove(ix);
        }
    }

    fn all_replied(&self) -> bool {
        (1..self.replies.len() as SiteId)
            .filter(|site| *site != self.id)
            .all(|site| self.replies[site as usize])
    }

    fn entry_condition(&self) -> bool {
        match self.own {
            Some(own) => self.all_replied() && self.queue.first() == Some(&own),
            None => false,
        }
    }

    fn payload(&self, kind: SubType, request: Request) -> Payload {
        debug_assert_eq!(request.site, self.id);
        Payload::Lamport { kind, request }
    }

    fn verdict(&self, state: CsState) -> Entry {
        if state == CsState::Pending && self.entry_condition() {
            Entry::Granted
        } else {
            Entry::Pending
        }
    }
}

impl Policy for Lamport {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Lamport
    }

    fn begin_request(&mut self, cx: &mut Cx) -> Entry {
        let own = Request::new(Timestamp::now(), self.id);
        self.replies.fill(false);
        self.own = Some(own);
        self.insert(own);
        debug!("requesting with {:?}", own);
        cx.broadcast(self.payload(SubType::Request, own));
        // With a single deployed site the condition holds vacuously.
        self.verdict(CsState::Pending)
    }

    fn on_peer_message(
        &mut self,
        cx: &mut Cx,
        state: CsState,
        payload: &Payload,
    ) -> Result<Entry, Error> {
        let (kind, request) = match payload {
            Payload::Lamport { kind, request } => (*kind, *request),
            other => return Err(Error::ForeignAlgorithm(other.algorithm())),
        };
        if request.site as usize >= self.replies.len() {
            return Err(Error::BadSite(request.site));
        }
        match kind {
            SubType::Request => {
                // Queue the sender and grant permission unconditionally; the
                // queue order is what arbitrates entry.
                self.insert(request);
                let reply = Request::new(Timestamp::now(), self.id);
                cx.send(request.site, self.payload(SubType::Reply, reply));
            }
            SubType::Reply => {
                trace!("reply from {}", request.site);
                self.replies[request.site as usize] = true;
            }
            SubType::Release => {
                debug!("release from {}", request.site);
                self.remove(request.site);
            }
        }
        Ok(self.verdict(state))
    }

    fn release(&mut self, cx: &mut Cx) {
        self.remove(self.id);
        self.own = None;
        let notice = Request::new(Timestamp::now(), self.id);
        cx.broadcast(self.payload(SubType::Release, notice));
    }
}
