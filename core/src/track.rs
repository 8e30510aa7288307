//! Per-invocation call records.
//!
//! A [`Track`] is created for every invocation of a wrapped function and
//! carries everything the engine knows about that one call: its sequence
//! number, its place in the pending → fulfilled | rejected state machine,
//! and a private keyed data store addons use as scratch space. A private
//! key may additionally be published under a [`SharedKey`] alias, after
//! which every write to it fans out a change notification; that is the
//! only broadcast mechanism a track has.
//!
//! Addons never hold a `Track` directly. They get a [`TrackHandle`], which
//! exposes the same queries but cannot drive the state machine and filters
//! writes to the engine's [`ReservedKeys`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::key::{DataKey, SharedKey, TrackValue};
use crate::tracker::{Outcome, Tracker};

/// Where a call currently is in its lifecycle.
///
/// `Pending` is the only non-terminal state; both terminal states are
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackState {
    /// The call is still running.
    Pending,
    /// The call completed with a value.
    Fulfilled,
    /// The call completed with an error.
    Rejected,
}

impl TrackState {
    /// Whether the state machine can still move.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// The terminal outcome, if this state is terminal.
    #[must_use]
    pub const fn outcome(self) -> Option<Outcome> {
        match self {
            Self::Pending => None,
            Self::Fulfilled => Some(Outcome::Fulfilled),
            Self::Rejected => Some(Outcome::Rejected),
        }
    }
}

impl From<Outcome> for TrackState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Fulfilled => Self::Fulfilled,
            Outcome::Rejected => Self::Rejected,
        }
    }
}

/// Observer invoked when an aliased key changes; receives the shared alias
/// and the new value (`None` on delete).
pub type ChangeObserver = Arc<dyn Fn(SharedKey, Option<&TrackValue>) + Send + Sync>;

#[derive(Default)]
struct TrackData {
    values: HashMap<DataKey, TrackValue>,
    private_to_shared: HashMap<DataKey, SharedKey>,
    shared_to_private: HashMap<SharedKey, DataKey>,
}

/// One invocation's tracked state.
pub struct Track {
    sn: u64,
    tracker: Arc<Tracker>,
    state: Mutex<TrackState>,
    data: Mutex<TrackData>,
    observers: Mutex<Vec<ChangeObserver>>,
}

impl Track {
    /// Creates a pending record for sequence number `sn` drawn from
    /// `tracker`.
    #[must_use]
    pub fn new(sn: u64, tracker: Arc<Tracker>) -> Self {
        Self {
            sn,
            tracker,
            state: Mutex::new(TrackState::Pending),
            data: Mutex::new(TrackData::default()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// This call's sequence number.
    #[must_use]
    pub const fn sn(&self) -> u64 {
        self.sn
    }

    /// Current state of the call.
    #[must_use]
    pub fn state(&self) -> TrackState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the call to `Fulfilled`.
    ///
    /// Returns `true` on the first transition and `false` (a no-op) once
    /// the call is already terminal. The tracker is consulted exactly once
    /// per successful transition: the call's own record always settles,
    /// even when a newer call has already claimed the latest slot.
    pub fn fulfill(&self) -> bool {
        self.settle(Outcome::Fulfilled)
    }

    /// Moves the call to `Rejected`; same no-op rules as [`Track::fulfill`].
    pub fn reject(&self) -> bool {
        self.settle(Outcome::Rejected)
    }

    fn settle(&self, outcome: Outcome) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_terminal() {
                return false;
            }
            *state = outcome.into();
        }
        self.tracker.record_if_latest(outcome, self.sn);
        true
    }

    /// Whether this call is the authoritative one.
    ///
    /// With `None`: is this the most recently created call. With an
    /// outcome: is this call currently in that state *and* the freshest one
    /// to have reached it.
    #[must_use]
    pub fn is_latest(&self, outcome: Option<Outcome>) -> bool {
        match outcome {
            None => self.sn == self.tracker.last_sn(),
            Some(outcome) => {
                self.state().outcome() == Some(outcome)
                    && self.tracker.latest_sn(Some(outcome)) == self.sn
            }
        }
    }

    /// Whether a newer call has already reached `outcome` (`None` =
    /// finished in either way), i.e. whether this call's result is stale.
    #[must_use]
    pub fn has_later(&self, outcome: Option<Outcome>) -> bool {
        self.tracker.latest_sn(outcome) > self.sn
    }

    /// Stores `value` under `key`; `None` deletes the key.
    ///
    /// If the key has a shared alias the change is fanned out to all
    /// registered observers (after the store is updated and the lock is
    /// released, so observers may read and write data freely).
    pub fn set_data(&self, key: DataKey, value: Option<TrackValue>) {
        let shared = {
            let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
            match &value {
                Some(v) => {
                    data.values.insert(key, Arc::clone(v));
                }
                None => {
                    data.values.remove(&key);
                }
            }
            data.private_to_shared.get(&key).copied()
        };
        if let Some(shared) = shared {
            self.notify(shared, value.as_ref());
        }
    }

    /// Reads the value stored under a private key.
    #[must_use]
    pub fn get_data(&self, key: DataKey) -> Option<TrackValue> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values
            .get(&key)
            .cloned()
    }

    /// Reads through a shared alias, resolving it to its private key.
    #[must_use]
    pub fn get_shared(&self, key: SharedKey) -> Option<TrackValue> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let private = data.shared_to_private.get(&key)?;
        data.values.get(private).cloned()
    }

    /// Removes and returns the value under `key`.
    ///
    /// A take is a silent handoff: unlike a delete through
    /// [`Track::set_data`], it never notifies shared observers.
    pub fn take_data(&self, key: DataKey) -> Option<TrackValue> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values
            .remove(&key)
    }

    /// Publishes `private` under the `shared` alias.
    ///
    /// Each private key may be shared at most once and each shared key may
    /// receive at most one private key; any conflict returns `false` and
    /// changes nothing.
    pub fn share_data(&self, private: DataKey, shared: SharedKey) -> bool {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        if data.private_to_shared.contains_key(&private)
            || data.shared_to_private.contains_key(&shared)
        {
            return false;
        }
        data.private_to_shared.insert(private, shared);
        data.shared_to_private.insert(shared, private);
        true
    }

    /// Registers an observer for aliased-key changes.
    pub fn on_data_change<F>(&self, observer: F)
    where
        F: Fn(SharedKey, Option<&TrackValue>) + Send + Sync + 'static,
    {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    fn notify(&self, shared: SharedKey, value: Option<&TrackValue>) {
        let snapshot: Vec<ChangeObserver> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in snapshot {
            observer(shared, value);
        }
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("sn", &self.sn)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// The engine's five bookkeeping keys, allocated once per wrapped function.
///
/// Four of them (arguments, error, loading, data-updated) are read-only
/// through the addon-facing [`TrackHandle`]. The fifth, the current result
/// value, accepts addon writes only while the call is pending, so an addon
/// can seed or massage a result but can never clobber a settled one.
#[derive(Debug)]
pub struct ReservedKeys {
    arguments: (DataKey, SharedKey),
    error: (DataKey, SharedKey),
    loading: (DataKey, SharedKey),
    data_updated: (DataKey, SharedKey),
    data: (DataKey, SharedKey),
}

impl ReservedKeys {
    /// Allocates a fresh reserved-key set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arguments: (DataKey::new(), SharedKey::new()),
            error: (DataKey::new(), SharedKey::new()),
            loading: (DataKey::new(), SharedKey::new()),
            data_updated: (DataKey::new(), SharedKey::new()),
            data: (DataKey::new(), SharedKey::new()),
        }
    }

    /// The arguments-snapshot key.
    #[must_use]
    pub const fn arguments(&self) -> DataKey {
        self.arguments.0
    }

    /// Shared alias of the arguments-snapshot key.
    #[must_use]
    pub const fn arguments_shared(&self) -> SharedKey {
        self.arguments.1
    }

    /// The error key.
    #[must_use]
    pub const fn error(&self) -> DataKey {
        self.error.0
    }

    /// Shared alias of the error key.
    #[must_use]
    pub const fn error_shared(&self) -> SharedKey {
        self.error.1
    }

    /// The loading-flag key.
    #[must_use]
    pub const fn loading(&self) -> DataKey {
        self.loading.0
    }

    /// Shared alias of the loading-flag key.
    #[must_use]
    pub const fn loading_shared(&self) -> SharedKey {
        self.loading.1
    }

    /// The data-updated timestamp key.
    #[must_use]
    pub const fn data_updated(&self) -> DataKey {
        self.data_updated.0
    }

    /// Shared alias of the data-updated timestamp key.
    #[must_use]
    pub const fn data_updated_shared(&self) -> SharedKey {
        self.data_updated.1
    }

    /// The current-result-value key.
    #[must_use]
    pub const fn data(&self) -> DataKey {
        self.data.0
    }

    /// Shared alias of the current-result-value key.
    #[must_use]
    pub const fn data_shared(&self) -> SharedKey {
        self.data.1
    }

    /// Whether `key` is permanently read-only for addons.
    #[must_use]
    pub const fn is_read_only(&self, key: DataKey) -> bool {
        key.id() == self.arguments.0.id()
            || key.id() == self.error.0.id()
            || key.id() == self.loading.0.id()
            || key.id() == self.data_updated.0.id()
    }

    /// Whether `key` is the pending-writable result-value key.
    #[must_use]
    pub const fn is_data(&self, key: DataKey) -> bool {
        key.id() == self.data.0.id()
    }

    /// Aliases all five keys on a freshly created track.
    pub fn install(&self, track: &Track) {
        // A fresh track has no aliases yet, so these cannot conflict.
        track.share_data(self.arguments.0, self.arguments.1);
        track.share_data(self.error.0, self.error.1);
        track.share_data(self.loading.0, self.loading.1);
        track.share_data(self.data_updated.0, self.data_updated.1);
        track.share_data(self.data.0, self.data.1);
    }
}

impl Default for ReservedKeys {
    fn default() -> Self {
        Self::new()
    }
}

/// Addon-facing view of a [`Track`].
///
/// Cloning is cheap; every clone refers to the same record. The handle has
/// no `fulfill`/`reject` (addons observe the lifecycle, they do not drive
/// it), and its write operations silently drop attempts against reserved
/// keys, so a misbehaving addon cannot corrupt engine bookkeeping.
#[derive(Clone)]
pub struct TrackHandle {
    track: Arc<Track>,
    reserved: Arc<ReservedKeys>,
}

impl TrackHandle {
    /// Wraps a track for addon consumption.
    #[must_use]
    pub fn new(track: Arc<Track>, reserved: Arc<ReservedKeys>) -> Self {
        Self { track, reserved }
    }

    /// This call's sequence number.
    #[must_use]
    pub fn sn(&self) -> u64 {
        self.track.sn()
    }

    /// Current state of the call.
    #[must_use]
    pub fn state(&self) -> TrackState {
        self.track.state()
    }

    /// See [`Track::is_latest`].
    #[must_use]
    pub fn is_latest(&self, outcome: Option<Outcome>) -> bool {
        self.track.is_latest(outcome)
    }

    /// See [`Track::has_later`].
    #[must_use]
    pub fn has_later(&self, outcome: Option<Outcome>) -> bool {
        self.track.has_later(outcome)
    }

    /// The engine's reserved keys, for reading engine bookkeeping.
    #[must_use]
    pub fn reserved(&self) -> &ReservedKeys {
        &self.reserved
    }

    /// Reads a private key; reserved keys included, reads are never
    /// restricted.
    #[must_use]
    pub fn get_data(&self, key: DataKey) -> Option<TrackValue> {
        self.track.get_data(key)
    }

    /// Reads through a shared alias.
    #[must_use]
    pub fn get_shared(&self, key: SharedKey) -> Option<TrackValue> {
        self.track.get_shared(key)
    }

    /// Stores `value` under `key` (`None` deletes), unless `key` is
    /// reserved.
    ///
    /// Writes to the four read-only reserved keys are always dropped;
    /// writes to the result-value key are dropped once the call is
    /// terminal. Dropped writes are silent apart from a log line.
    pub fn set_data(&self, key: DataKey, value: Option<TrackValue>) {
        if !self.writable(key, "set_data") {
            return;
        }
        self.track.set_data(key, value);
    }

    /// Removes and returns the value under `key`, with the same
    /// reserved-key filtering as [`TrackHandle::set_data`].
    pub fn take_data(&self, key: DataKey) -> Option<TrackValue> {
        if !self.writable(key, "take_data") {
            return None;
        }
        self.track.take_data(key)
    }

    /// Publishes `private` under `shared`; see [`Track::share_data`].
    ///
    /// Reserved keys are already aliased by the engine, so sharing one
    /// again fails through the ordinary one-shot rule.
    pub fn share_data(&self, private: DataKey, shared: SharedKey) -> bool {
        self.track.share_data(private, shared)
    }

    fn writable(&self, key: DataKey, operation: &str) -> bool {
        if self.reserved.is_read_only(key) {
            tracing::warn!(
                sn = self.track.sn(),
                %key,
                operation,
                "dropped write to read-only reserved key"
            );
            return false;
        }
        if self.reserved.is_data(key) && self.track.state().is_terminal() {
            tracing::warn!(
                sn = self.track.sn(),
                %key,
                operation,
                "dropped result-value write on settled call"
            );
            return false;
        }
        true
    }
}

impl std::fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackHandle")
            .field("sn", &self.sn())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{track_value, value_as};

    fn fresh_track(tracker: &Arc<Tracker>) -> Track {
        Track::new(tracker.next_sn(), Arc::clone(tracker))
    }

    #[test]
    fn terminal_transitions_are_one_shot() {
        let tracker = Arc::new(Tracker::new());
        let track = fresh_track(&tracker);

        assert_eq!(track.state(), TrackState::Pending);
        assert!(track.fulfill());
        assert_eq!(track.state(), TrackState::Fulfilled);

        // Re-entry in either direction is a no-op.
        assert!(!track.fulfill());
        assert!(!track.reject());
        assert_eq!(track.state(), TrackState::Fulfilled);
        // The tracker saw exactly the one successful transition.
        assert_eq!(tracker.latest_sn(Some(Outcome::Fulfilled)), track.sn());
        assert_eq!(tracker.latest_sn(Some(Outcome::Rejected)), 0);
    }

    #[test]
    fn stale_settlement_keeps_its_own_record() {
        let tracker = Arc::new(Tracker::new());
        let first = fresh_track(&tracker);
        let second = fresh_track(&tracker);

        assert!(second.fulfill());
        assert!(first.fulfill());

        // Both records settled, but only the newer one is authoritative.
        assert_eq!(first.state(), TrackState::Fulfilled);
        assert!(!first.is_latest(Some(Outcome::Fulfilled)));
        assert!(second.is_latest(Some(Outcome::Fulfilled)));
        assert!(first.has_later(Some(Outcome::Fulfilled)));
        assert!(first.has_later(None));
        assert!(!second.has_later(None));
    }

    #[test]
    fn is_latest_without_outcome_means_most_recently_created() {
        let tracker = Arc::new(Tracker::new());
        let first = fresh_track(&tracker);
        assert!(first.is_latest(None));
        let second = fresh_track(&tracker);
        assert!(!first.is_latest(None));
        assert!(second.is_latest(None));
    }

    #[test]
    fn set_get_take_round_trip() {
        let tracker = Arc::new(Tracker::new());
        let track = fresh_track(&tracker);
        let key = DataKey::new();

        assert!(track.get_data(key).is_none());
        track.set_data(key, Some(track_value("hello".to_string())));
        let stored = track.get_data(key);
        assert_eq!(
            stored.as_ref().and_then(value_as::<String>),
            Some(&"hello".to_string())
        );

        let taken = track.take_data(key);
        assert!(taken.is_some());
        assert!(track.get_data(key).is_none());
        assert!(track.take_data(key).is_none());
    }

    #[test]
    fn set_data_none_deletes() {
        let tracker = Arc::new(Tracker::new());
        let track = fresh_track(&tracker);
        let key = DataKey::new();

        track.set_data(key, Some(track_value(1_u32)));
        track.set_data(key, None);
        assert!(track.get_data(key).is_none());
    }

    #[test]
    fn share_data_is_one_shot_per_side() {
        let tracker = Arc::new(Tracker::new());
        let track = fresh_track(&tracker);
        let private_a = DataKey::new();
        let private_b = DataKey::new();
        let shared_a = SharedKey::new();
        let shared_b = SharedKey::new();

        assert!(track.share_data(private_a, shared_a));
        // Same private key again, even under another alias.
        assert!(!track.share_data(private_a, shared_b));
        // Same shared alias for another private key.
        assert!(!track.share_data(private_b, shared_a));
        // Fresh pair still works.
        assert!(track.share_data(private_b, shared_b));
    }

    #[test]
    fn aliased_writes_notify_and_resolve() {
        let tracker = Arc::new(Tracker::new());
        let track = fresh_track(&tracker);
        let private = DataKey::new();
        let shared = SharedKey::new();
        track.share_data(private, shared);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        track.on_data_change(move |key, value| {
            let rendered = value.and_then(value_as::<u32>).copied();
            seen_in
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((key, rendered));
        });

        track.set_data(private, Some(track_value(7_u32)));
        track.set_data(private, None);
        // Unaliased keys stay silent.
        track.set_data(DataKey::new(), Some(track_value(9_u32)));

        let log = seen.lock().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(*log, vec![(shared, Some(7)), (shared, None)]);
        // The next write notifies again and the observer re-locks `seen`.
        drop(log);

        track.set_data(private, Some(track_value(8_u32)));
        let through_alias = track.get_shared(shared);
        assert_eq!(
            through_alias.as_ref().and_then(value_as::<u32>),
            Some(&8)
        );
    }

    #[test]
    fn take_data_is_silent() {
        let tracker = Arc::new(Tracker::new());
        let track = fresh_track(&tracker);
        let private = DataKey::new();
        let shared = SharedKey::new();
        track.share_data(private, shared);

        let notifications = Arc::new(Mutex::new(0_usize));
        let notifications_in = Arc::clone(&notifications);
        track.on_data_change(move |_, _| {
            *notifications_in
                .lock()
                .unwrap_or_else(PoisonError::into_inner) += 1;
        });

        track.set_data(private, Some(track_value(1_u32)));
        assert!(track.take_data(private).is_some());
        assert_eq!(
            *notifications.lock().unwrap_or_else(PoisonError::into_inner),
            1
        );
    }

    #[test]
    fn handle_drops_reserved_writes() {
        let tracker = Arc::new(Tracker::new());
        let track = Arc::new(fresh_track(&tracker));
        let reserved = Arc::new(ReservedKeys::new());
        reserved.install(&track);
        let handle = TrackHandle::new(Arc::clone(&track), Arc::clone(&reserved));

        track.set_data(reserved.loading(), Some(track_value(true)));
        handle.set_data(reserved.loading(), Some(track_value(false)));
        handle.set_data(reserved.arguments(), None);
        assert!(handle.take_data(reserved.error()).is_none());

        // The engine-written value survived every addon attempt.
        let loading = handle.get_data(reserved.loading());
        assert_eq!(loading.as_ref().and_then(value_as::<bool>), Some(&true));
    }

    #[test]
    fn result_value_writable_only_while_pending() {
        let tracker = Arc::new(Tracker::new());
        let track = Arc::new(fresh_track(&tracker));
        let reserved = Arc::new(ReservedKeys::new());
        reserved.install(&track);
        let handle = TrackHandle::new(Arc::clone(&track), Arc::clone(&reserved));

        handle.set_data(reserved.data(), Some(track_value(1_u32)));
        let seeded = handle.get_data(reserved.data());
        assert_eq!(seeded.as_ref().and_then(value_as::<u32>), Some(&1));

        track.fulfill();
        handle.set_data(reserved.data(), Some(track_value(2_u32)));
        let after = handle.get_data(reserved.data());
        assert_eq!(after.as_ref().and_then(value_as::<u32>), Some(&1));
    }

    #[test]
    fn handle_cannot_reshare_reserved_keys() {
        let tracker = Arc::new(Tracker::new());
        let track = Arc::new(fresh_track(&tracker));
        let reserved = Arc::new(ReservedKeys::new());
        reserved.install(&track);
        let handle = TrackHandle::new(Arc::clone(&track), Arc::clone(&reserved));

        assert!(!handle.share_data(reserved.data(), SharedKey::new()));
    }
}
