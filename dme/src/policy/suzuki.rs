//! # Summary
//!
//! Token-passing mutual exclusion. A single token — a per-site count of last
//! executed requests plus a hand-off queue — exists system-wide; only its
//! holder may enter. Requests are broadcast with a per-site sequence number
//! so stale and duplicated REQUESTs are told apart from outstanding ones:
//! site j has an outstanding request exactly when its highest seen sequence
//! number is one ahead of the token's last-executed count for j.
//!
//! Token loss (a dropped REPLY) is a known unhandled failure mode; only
//! REQUEST messages are safe to lose.

use log::{debug, trace};

use crate::config::SiteId;
use crate::error::Error;
use crate::fsm::CsState;
use crate::message::{Algorithm, Payload, SubType, Token};
use crate::policy::{Cx, Entry, Policy};

pub struct Suzuki {
    id: SiteId,
    /// Highest request sequence number observed per site, monotonically
    /// non-decreasing, indexed by site id.
    seen: Vec<u32>,
    /// The token, while this site holds it.
    token: Option<Token>,
}

impl Suzuki {
    pub fn new(id: SiteId, count: usize, holds_token: bool) -> Self {
        Suzuki {
            id,
            seen: vec![0; count + 1],
            token: holds_token.then(|| Token::new(count)),
        }
    }

    /// Queues `site` on the token if its outstanding request is exactly one
    /// ahead of the token's record and it is not already queued.
    fn enqueue_if_outstanding(token: &mut Token, seen: &[u32], site: SiteId) {
        let ix = site as usize;
        if seen[ix] == token.last_executed[ix] + 1 && !token.queue.contains(&site) {
            trace!("queueing site {} on the token", site);
            token.queue.push_back(site);
        }
    }

    /// Hands the token to the head of its queue, if anyone is waiting.
    fn hand_off(&mut self, cx: &mut Cx) {
        // The queue travels with the token, minus its new holder.
        let next = match self.token.as_mut().and_then(|token| token.queue.pop_front()) {
            Some(next) => next,
            None => return,
        };
        let Some(token) = self.token.take() else {
            return;
        };
        debug!("passing token to site {}", next);
        cx.send(
            next,
            Payload::Suzuki {
                kind: SubType::Reply,
                site: self.id,
                seq: self.seen[self.id as usize],
                token: Some(token),
            },
        );
    }
}

impl Policy for Suzuki {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Suzuki
    }

    fn holds_token(&self) -> bool {
        self.token.is_some()
    }

    fn begin_request(&mut self, cx: &mut Cx) -> Entry {
        self.seen[self.id as usize] += 1;
        if self.token.is_some() {
            debug!("token already in hand; entering immediately");
            return Entry::Granted;
        }
        cx.broadcast(Payload::Suzuki {
            kind: SubType::Request,
            site: self.id,
            seq: self.seen[self.id as usize],
            token: None,
        });
        Entry::Pending
    }

    fn on_peer_message(
        &mut self,
        cx: &mut Cx,
        state: CsState,
        payload: &Payload,
    ) -> Result<Entry, Error> {
        let (kind, site, seq, token) = match payload {
            Payload::Suzuki {
                kind,
                site,
                seq,
                token,
            } => (*kind, *site, *seq, token.clone()),
            other => return Err(Error::ForeignAlgorithm(other.algorithm())),
        };
        if site as usize >= self.seen.len() {
            return Err(Error::BadSite(site));
        }
        match kind {
            SubType::Request => {
                let ix = site as usize;
                self.seen[ix] = self.seen[ix].max(seq);
                if let Some(token) = self.token.as_mut() {
                    Self::enqueue_if_outstanding(token, &self.seen, site);
                }
                // An idle holder serves waiters right away; an executing one
                // keeps the token until release.
                if state != CsState::Executing {
                    self.hand_off(cx);
                }
                Ok(Entry::Pending)
            }
            SubType::Reply => {
                let token = token.ok_or(Error::BadSubType(SubType::Reply.tag()))?;
                debug!("token received from site {}", site);
                self.token = Some(token);
                if state == CsState::Pending {
                    Ok(Entry::Granted)
                } else {
                    Ok(Entry::Pending)
                }
            }
            SubType::Release => Err(Error::BadSubType(SubType::Release.tag())),
        }
    }

    fn release(&mut self, cx: &mut Cx) {
        let Some(token) = self.token.as_mut() else {
            // Release without the token would mean the FSM let us execute
            // without permission; there is nothing sane to do here.
            debug!("release without token");
            return;
        };
        token.last_executed[self.id as usize] += 1;
        for site in 1..self.seen.len() as SiteId {
            if site != self.id {
                Self::enqueue_if_outstanding(token, &self.seen, site);
            }
        }
        self.hand_off(cx);
    }
}
