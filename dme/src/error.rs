//! # Summary
//!
//! Error type shared across the testbed. Errors are split into two severity
//! classes: recoverable ones (malformed datagrams, failed sends, a full timer
//! pool) are logged and dropped by their callers, while fatal ones (invalid
//! state transitions, unregistered events) stop the dispatch loop.

use thiserror::Error;

use crate::event::EventKind;
use crate::fsm::CsState;

#[derive(Debug, Error)]
pub enum Error {
    /// Datagram shorter than the fixed header it claims to carry.
    #[error("datagram too short ({0} bytes)")]
    ShortDatagram(usize),

    /// Leading magic matches neither the peer nor the supervisor constant.
    #[error("unrecognized magic 0x{0:08X}")]
    BadMagic(u32),

    /// Peer header carries an algorithm tag outside the shared enumeration.
    #[error("unknown algorithm tag {0}")]
    BadAlgorithm(u16),

    /// Payload sub-type is not valid for the algorithm that sent it.
    #[error("unknown message sub-type {0}")]
    BadSubType(u16),

    /// Supervisor message type outside {WANT_CS, ENTERED_CS, EXITED_CS}.
    #[error("unknown supervisor message type {0}")]
    BadSupType(u16),

    /// A peer message decoded to a different algorithm than the active one.
    #[error("message for foreign algorithm {0:?}")]
    ForeignAlgorithm(crate::message::Algorithm),

    /// Site id outside the configured range.
    #[error("site id {0} out of bounds")]
    BadSite(u64),

    /// Topology file could not be parsed.
    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// All timers in the fixed pool are armed.
    #[error("timer pool exhausted")]
    TimerPoolExhausted,

    /// An event kind was dispatched without a registered handler.
    #[error("no handler registered for {0:?}")]
    UnhandledEvent(EventKind),

    /// Attempted to register a handler for an internally dispatched kind.
    #[error("event kind {0:?} is reserved")]
    ReservedEvent(EventKind),

    /// An FSM transition was requested from a state that cannot accept it.
    #[error("{0:?} requested while in state {1:?}")]
    BadTransition(EventKind, CsState),
}

impl Error {
    /// Errors at or above this severity abort the dispatch loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnhandledEvent(_) | Error::ReservedEvent(_) | Error::BadTransition(..)
        )
    }
}
