//! # Summary
//!
//! Logical timestamps and request records. A timestamp is a wall-clock
//! (seconds, nanoseconds) pair used only for relative ordering between sites,
//! never as absolute time. Ties between identical timestamps are broken by
//! site identity, smaller id first, so that requests form a strict total
//! order across the whole system.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::SiteId;

/// Wall-clock (seconds, nanoseconds) pair with the on-wire precision.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub secs: u32,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: u32, nanos: u32) -> Self {
        Timestamp { secs, nanos }
    }

    /// Current wall-clock time, truncated to the wire width.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Timestamp {
            secs: since_epoch.as_secs() as u32,
            nanos: since_epoch.subsec_nanos(),
        }
    }

    /// The pair reinterpreted as a span, for deltas carried on the wire.
    pub fn as_duration(self) -> Duration {
        Duration::new(self.secs as u64, self.nanos)
    }
}

impl From<Duration> for Timestamp {
    fn from(delta: Duration) -> Self {
        Timestamp {
            secs: delta.as_secs() as u32,
            nanos: delta.subsec_nanos(),
        }
    }
}

/// A pending claim on the critical region: who asked, and when.
///
/// The derived ordering compares seconds, then nanoseconds, then site id,
/// which is exactly the total order the queue-based policies rely on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Request {
    pub stamp: Timestamp,
    pub site: SiteId,
}

impl Request {
    pub fn new(stamp: Timestamp, site: SiteId) -> Self {
        Request { stamp, site }
    }
}
