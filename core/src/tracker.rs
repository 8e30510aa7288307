//! Sequence-number allocation and latest-wins bookkeeping.
//!
//! One [`Tracker`] is owned by one wrapped function. Every invocation draws
//! a strictly increasing sequence number from it, and every terminal
//! transition reports back through [`Tracker::record_if_latest`]. The
//! tracker never decides whether a call may settle; it only remembers, per
//! terminal outcome, the highest sequence number that has reached it, which
//! is what consumers query to ignore stale results.
//!
//! All operations are total functions over integers, implemented with
//! atomics: overlapping calls of the wrapped function can race freely
//! without external locking.

use std::sync::atomic::{AtomicU64, Ordering};

/// Terminal outcome of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The call completed with a value.
    Fulfilled,
    /// The call completed with an error.
    Rejected,
}

/// Allocates sequence numbers and records the freshest settled call.
///
/// `latest_*` cells hold 0 while no call has reached that outcome;
/// sequence numbers start at 1, so 0 is never a valid call id.
#[derive(Debug, Default)]
pub struct Tracker {
    allocated: AtomicU64,
    latest_fulfilled: AtomicU64,
    latest_rejected: AtomicU64,
}

impl Tracker {
    /// Creates a tracker with no calls recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws the next sequence number (1, 2, 3, …).
    pub fn next_sn(&self) -> u64 {
        self.allocated.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Highest sequence number handed out so far; 0 before the first call.
    #[must_use]
    pub fn last_sn(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Records `sn` as the freshest call to reach `outcome`, unless a
    /// higher sequence number already has.
    ///
    /// Returns `true` iff `sn` is strictly greater than the stored value,
    /// i.e. iff this call is now the authoritative one for `outcome`. A
    /// losing write leaves the stored value untouched.
    pub fn record_if_latest(&self, outcome: Outcome, sn: u64) -> bool {
        let prev = self.cell(outcome).fetch_max(sn, Ordering::AcqRel);
        prev < sn
    }

    /// Freshest sequence number that reached `outcome`, or, with `None`,
    /// the derived "finished" pseudo-state covering both outcomes.
    ///
    /// Returns 0 when nothing has reached the queried state yet.
    #[must_use]
    pub fn latest_sn(&self, outcome: Option<Outcome>) -> u64 {
        match outcome {
            Some(outcome) => self.cell(outcome).load(Ordering::Acquire),
            None => self
                .latest_fulfilled
                .load(Ordering::Acquire)
                .max(self.latest_rejected.load(Ordering::Acquire)),
        }
    }

    /// Whether any call has settled, regardless of outcome.
    #[must_use]
    pub fn has_any_finished(&self) -> bool {
        self.latest_sn(None) > 0
    }

    const fn cell(&self, outcome: Outcome) -> &AtomicU64 {
        match outcome {
            Outcome::Fulfilled => &self.latest_fulfilled,
            Outcome::Rejected => &self.latest_rejected,
        }
    }
}
