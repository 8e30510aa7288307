//! Addon output slots and the merged state map.
//!
//! During pipeline setup every addon hands back a [`Contribution`]: an
//! ordered list of template keys (see [`crate::naming`]) paired with the
//! state object to publish under each. Contributions are merged in install
//! order into a [`StateMap`], the type-erased bag of slots a built pipeline
//! exposes to its consumers.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::key::{TrackValue, value_as};

/// Ordered output slots produced by one addon.
#[derive(Default)]
pub struct Contribution {
    entries: Vec<(String, TrackValue)>,
}

impl Contribution {
    /// An empty contribution, for addons that only observe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a slot, builder style.
    ///
    /// # Example
    ///
    /// ```
    /// use calltrack_core::contribution::Contribution;
    ///
    /// let contribution = Contribution::new()
    ///     .with("{name}Calls", 0_u64)
    ///     .with("{name}Reset", "handle");
    /// assert_eq!(contribution.len(), 2);
    /// ```
    #[must_use]
    pub fn with<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: T) -> Self {
        self.insert(key, Arc::new(value));
        self
    }

    /// Adds an already-erased slot.
    pub fn insert(&mut self, key: impl Into<String>, value: TrackValue) {
        self.entries.push((key.into(), value));
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the contribution has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Slots in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &TrackValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Consumes the contribution, yielding slots in insertion order.
    #[must_use]
    pub fn into_entries(self) -> Vec<(String, TrackValue)> {
        self.entries
    }
}

impl std::fmt::Debug for Contribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contribution")
            .field(
                "keys",
                &self.entries.iter().map(|(key, _)| key).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Keys that appear more than once, listed once each in first-collision
/// order. Empty means the key set is sound.
#[must_use]
pub fn duplicate_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut offenders = Vec::new();
    for key in keys {
        let count = counts.entry(key).or_insert(0);
        *count += 1;
        if *count == 2 {
            offenders.push(key.to_string());
        }
    }
    offenders
}

/// Merged, name-bound output slots of a built pipeline.
#[derive(Default)]
pub struct StateMap {
    slots: HashMap<String, TrackValue>,
}

impl StateMap {
    /// An empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a slot; returns `false` (leaving the map unchanged) when the
    /// key is already occupied.
    pub fn insert(&mut self, key: String, value: TrackValue) -> bool {
        match self.slots.entry(key) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    /// Typed read of a slot; `None` when the key is absent or the slot
    /// holds a different type.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.slots.get(key).and_then(value_as::<T>)
    }

    /// Type-erased read of a slot.
    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<&TrackValue> {
        self.slots.get(key)
    }

    /// Whether a slot exists under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// All slot keys, sorted for deterministic listings.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.slots.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the map has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl std::fmt::Debug for StateMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMap").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contribution_preserves_insertion_order() {
        let contribution = Contribution::new()
            .with("{name}B", 1_u8)
            .with("{name}A", 2_u8)
            .with("{name}C", 3_u8);
        let keys: Vec<&str> = contribution.entries().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["{name}B", "{name}A", "{name}C"]);
    }

    #[test]
    fn duplicate_keys_lists_each_offender_once() {
        let keys = ["a", "b", "a", "c", "b", "a"];
        assert_eq!(duplicate_keys(keys), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn duplicate_keys_is_empty_for_distinct_sets() {
        let keys = ["userLoading", "user", "userError"];
        assert!(duplicate_keys(keys).is_empty());
    }

    #[test]
    fn state_map_typed_reads() {
        let mut map = StateMap::new();
        assert!(map.insert("count".to_string(), Arc::new(3_u64)));
        assert!(map.insert("label".to_string(), Arc::new("ready".to_string())));

        assert_eq!(map.get::<u64>("count"), Some(&3));
        assert_eq!(map.get::<String>("label").map(String::as_str), Some("ready"));
        // Wrong type and missing key both miss.
        assert_eq!(map.get::<u32>("count"), None);
        assert_eq!(map.get::<u64>("missing"), None);
    }

    #[test]
    fn state_map_rejects_occupied_keys() {
        let mut map = StateMap::new();
        assert!(map.insert("slot".to_string(), Arc::new(1_u8)));
        assert!(!map.insert("slot".to_string(), Arc::new(2_u8)));
        assert_eq!(map.get::<u8>("slot"), Some(&1));
    }

    #[test]
    fn keys_are_sorted() {
        let mut map = StateMap::new();
        map.insert("b".to_string(), Arc::new(()));
        map.insert("a".to_string(), Arc::new(()));
        map.insert("c".to_string(), Arc::new(()));
        assert_eq!(map.keys(), vec!["a", "b", "c"]);
    }
}
