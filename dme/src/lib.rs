//! # Summary
//!
//! Distributed mutual exclusion testbed. One supervisor process prompts a
//! set of peer processes to compete for a single critical region; each peer
//! runs one of four interchangeable algorithms (timestamp-queue,
//! deferred-reply, token-passing, dynamic-request-set) over best-effort UDP.
//! All protocol state lives inside a single serialized dispatch loop per
//! process, so no further locking exists anywhere.

pub mod config;
pub mod error;
pub mod event;
pub mod fsm;
pub mod message;
pub mod net;
pub mod policy;
pub mod supervisor;
pub mod timestamp;

pub use crate::config::{Config, Site, SiteId, SUPERVISOR_ID};
pub use crate::error::Error;
pub use crate::event::{EventKind, Reactor};
pub use crate::fsm::{CsState, Peer};
pub use crate::message::Algorithm;
pub use crate::net::{Net, UdpNet};
pub use crate::policy::Policy;
pub use crate::supervisor::Supervisor;
