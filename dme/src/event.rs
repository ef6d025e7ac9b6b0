//! # Summary
//!
//! Single-threaded, cooperative event substrate. Handlers are bound to event
//! kinds in a registry; events are posted from anywhere (the UDP receiver,
//! timers, program logic) onto one single-consumer queue, and `run` delivers
//! them one at a time. While one handler executes no other handler runs, for
//! any kind — every piece of protocol state is mutated only from inside this
//! loop, with no further locking. This serialization is the load-bearing
//! safety property of the whole testbed.
//!
//! Timers come from a fixed pool of one-shot deadlines; expiry behaves like
//! `post`. Pool exhaustion is reported to the caller of `schedule`, which
//! decides what to do about it.

use std::collections::HashMap as Map;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, trace, warn};
use tokio::sync::mpsc;

use crate::error::Error;

/// Size of the one-shot timer pool.
pub const MAX_TIMERS: usize = 64;

/// Everything the dispatch loop can be asked to react to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A raw datagram arrived; demultiplexed by magic. Internal: the
    /// transport posts it, the substrate owner binds its handler.
    PacketIn,
    /// A decoded peer protocol message, chained from `PacketIn`.
    PeerMessage,
    /// A decoded supervisor message, chained from `PacketIn`.
    SupervisorMessage,
    /// The local site should start competing for the critical region.
    WantCriticalRegion,
    /// The active policy's entry condition holds.
    EnteredCriticalRegion,
    /// Simulated work is done; leave the critical region.
    ExitedCriticalRegion,
    /// Supervisor-side periodic election tick.
    PeriodicWork,
}

impl EventKind {
    /// Kinds dispatched by the substrate itself; `register` refuses them.
    fn is_reserved(self) -> bool {
        matches!(self, EventKind::PacketIn)
    }
}

/// One queued occurrence: a kind plus an opaque cookie (a raw datagram for
/// `PacketIn`, nothing for the rest).
#[derive(Debug)]
pub struct Event {
    pub kind: EventKind,
    pub cookie: Option<Vec<u8>>,
}

/// Handlers run inside the dispatch loop with exclusive access to the
/// context `C` and to the reactor itself (for chaining and timers). A fatal
/// error return stops the loop; anything else is logged and dropped.
pub type Handler<C> = fn(&mut C, &mut Reactor<C>, Option<Vec<u8>>) -> Result<(), Error>;

/// Cloneable posting handle, safe to use from other tasks.
#[derive(Clone)]
pub struct Queue {
    tx: mpsc::UnboundedSender<Event>,
}

impl Queue {
    /// Enqueues an event for asynchronous delivery. Never blocks and never
    /// invokes the handler inline.
    pub fn post(&self, kind: EventKind, cookie: Option<Vec<u8>>) {
        // Failure means the dispatch loop is gone; nothing left to notify.
        let _ = self.tx.send(Event { kind, cookie });
    }
}

/// The registry, queue, and timer pool driving one process.
pub struct Reactor<C> {
    registry: Map<EventKind, Handler<C>>,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    armed: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl<C> Default for Reactor<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Reactor<C> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Reactor {
            registry: Map::default(),
            tx,
            rx,
            armed: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Binds exactly one handler to an externally registrable kind.
    /// Re-registration before dispatch begins simply replaces the binding;
    /// reserved kinds fail loudly.
    pub fn register(&mut self, kind: EventKind, handler: Handler<C>) -> Result<(), Error> {
        if kind.is_reserved() {
            return Err(Error::ReservedEvent(kind));
        }
        self.registry.insert(kind, handler);
        Ok(())
    }

    /// Binds a handler for a reserved kind. Only the substrate's owner
    /// (the peer engine or the supervisor) wires these.
    pub(crate) fn register_internal(&mut self, kind: EventKind, handler: Handler<C>) {
        self.registry.insert(kind, handler);
    }

    /// A posting handle for the transport and timer tasks.
    pub fn queue(&self) -> Queue {
        Queue {
            tx: self.tx.clone(),
        }
    }

    /// Enqueues an event from inside the loop.
    pub fn post(&self, kind: EventKind, cookie: Option<Vec<u8>>) {
        let _ = self.tx.send(Event { kind, cookie });
    }

    /// Invokes the bound handler synchronously and returns its result. Used
    /// when the caller is already inside the serialized execution context and
    /// wants to chain a transition without a round trip through the queue.
    pub fn dispatch_now(
        &mut self,
        cx: &mut C,
        kind: EventKind,
        cookie: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        trace!("dispatching {:?}", kind);
        // Handlers are plain fn pointers, so re-entrant dispatch is fine.
        match self.registry.get(&kind).copied() {
            Some(handler) => handler(cx, self, cookie),
            None => Err(Error::UnhandledEvent(kind)),
        }
    }

    /// Arms a one-shot timer; on expiry it behaves like `post`. Fails if all
    /// `MAX_TIMERS` timers are armed — the caller decides how bad that is.
    pub fn schedule(
        &self,
        kind: EventKind,
        cookie: Option<Vec<u8>>,
        delay: Duration,
    ) -> Result<(), Error> {
        let armed = Arc::clone(&self.armed);
        if armed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < MAX_TIMERS).then_some(n + 1)
            })
            .is_err()
        {
            return Err(Error::TimerPoolExhausted);
        }
        trace!("armed timer for {:?} in {:?}", kind, delay);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            armed.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(Event { kind, cookie });
        });
        Ok(())
    }

    /// Number of currently armed timers.
    pub fn armed_timers(&self) -> usize {
        self.armed.load(Ordering::SeqCst)
    }

    /// Requests an orderly loop exit after the current event.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// A flag other tasks may use to observe or request shutdown.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Blocks the calling task, delivering at most one event at a time until
    /// the shutdown flag is set. Fatal handler errors set the flag and are
    /// returned; recoverable ones are logged and the loop continues.
    pub async fn run(&mut self, cx: &mut C) -> Result<(), Error> {
        while !self.shutdown.load(Ordering::SeqCst) {
            let event = match self.rx.recv().await {
                Some(event) => event,
                None => break,
            };
            if let Err(err) = self.dispatch_now(cx, event.kind, event.cookie) {
                if err.is_fatal() {
                    error!("fatal error handling {:?}: {}", event.kind, err);
                    self.shutdown.store(true, Ordering::SeqCst);
                    return Err(err);
                }
                warn!("error handling {:?}: {}", event.kind, err);
            }
        }
        Ok(())
    }
}
