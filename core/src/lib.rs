//! # Calltrack Core
//!
//! Core types for the calltrack call-tracking engine.
//!
//! This crate provides the building blocks the runtime composes into
//! monitored functions: per-function counters, per-invocation records with
//! a permissioned data store, a keyed synchronous event bus, and the
//! name-binding rules for addon output keys.
//!
//! ## Core Concepts
//!
//! - **Tracker**: per-function counter issuing dense sequence numbers and
//!   holding the latest-settled high-water marks
//! - **Track**: one invocation's record (state machine plus keyed data
//!   store with shared-alias broadcasting)
//! - **`DataKey` / `SharedKey`**: unforgeable store handles; only private
//!   keys accept writes, shared keys are read-and-observe aliases
//! - **`EventBus`**: synchronous dispatch of lifecycle events to keyed
//!   subscriber lists
//! - **Contribution / `StateMap`**: the output slots addons publish and the
//!   merged, name-bound bag a built pipeline exposes
//!
//! ## Example
//!
//! ```rust
//! use calltrack_core::{Outcome, Track, Tracker};
//! use std::sync::Arc;
//!
//! let tracker = Arc::new(Tracker::new());
//! let first = Track::new(tracker.next_sn(), Arc::clone(&tracker));
//! let second = Track::new(tracker.next_sn(), Arc::clone(&tracker));
//!
//! // Settling out of order: the later call owns the latest slot.
//! assert!(second.fulfill());
//! assert!(first.fulfill());
//! assert!(second.is_latest(Some(Outcome::Fulfilled)));
//! assert!(first.has_later(None));
//! ```

/// Argument snapshots and the first-argument projection
pub mod args;

/// Addon output slots and the merged state map
pub mod contribution;

/// Synchronous keyed event dispatch
pub mod event_bus;

/// Unforgeable data-store keys and type-erased values
pub mod key;

/// Instance-name substitution for template keys
pub mod naming;

/// Per-invocation call records and the addon-facing handle
pub mod track;

/// Per-function sequence numbers and latest-settled bookkeeping
pub mod tracker;

pub use args::CallArgs;
pub use contribution::{Contribution, StateMap};
pub use event_bus::{BusEvent, EventBus, SubscriberId};
pub use key::{DataKey, SharedKey, TrackValue, track_value, value_as};
pub use track::{ReservedKeys, Track, TrackHandle, TrackState};
pub use tracker::{Outcome, Tracker};
