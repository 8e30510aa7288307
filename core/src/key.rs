//! Unforgeable handles into a call record's data store.
//!
//! Keys are allocated from a process-wide counter, never from user input,
//! so holding a key *is* the permission to use it. A [`DataKey`] grants
//! read and write access to one slot; a [`SharedKey`] is a read-and-observe
//! alias another party can be handed without also handing over the right
//! to write. Values are type-erased behind [`TrackValue`] and recovered
//! with [`value_as`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static KEY_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_key_id() -> u64 {
    KEY_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Private handle to one data slot; grants read and write access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataKey(u64);

impl DataKey {
    /// Allocates a fresh key, distinct from every other key in the
    /// process.
    #[must_use]
    pub fn new() -> Self {
        Self(next_key_id())
    }

    /// The key's unique id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.0
    }
}

impl Default for DataKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data#{}", self.0)
    }
}

/// Read-and-observe alias for a slot published via sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedKey(u64);

impl SharedKey {
    /// Allocates a fresh alias key.
    #[must_use]
    pub fn new() -> Self {
        Self(next_key_id())
    }

    /// The key's unique id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.0
    }
}

impl Default for SharedKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shared#{}", self.0)
    }
}

/// Type-erased value stored in a call record.
pub type TrackValue = Arc<dyn Any + Send + Sync>;

/// Erases `value` for storage.
#[must_use]
pub fn track_value<T: Any + Send + Sync>(value: T) -> TrackValue {
    Arc::new(value)
}

/// Recovers a typed reference from a stored value.
///
/// Returns `None` when the slot holds a different type.
#[must_use]
pub fn value_as<T: Any>(value: &TrackValue) -> Option<&T> {
    value.downcast_ref::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_is_distinct() {
        let a = DataKey::new();
        let b = DataKey::new();
        let shared = SharedKey::new();
        assert_ne!(a, b);
        assert_ne!(a.id(), shared.id());
    }

    #[test]
    fn values_round_trip_through_erasure() {
        let stored = track_value("payload".to_string());
        assert_eq!(value_as::<String>(&stored).map(String::as_str), Some("payload"));
        assert_eq!(value_as::<u32>(&stored), None);
    }

    #[test]
    fn keys_render_with_their_role() {
        let key = DataKey::new();
        let alias = SharedKey::new();
        assert_eq!(key.to_string(), format!("data#{}", key.id()));
        assert_eq!(alias.to_string(), format!("shared#{}", alias.id()));
    }
}
