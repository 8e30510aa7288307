//! # Calltrack Runtime
//!
//! Runtime for the calltrack call-tracking engine.
//!
//! This crate wraps possibly-async functions so every invocation is
//! sequence-numbered, recorded and broadcast to observers, then composes
//! the wrapped function with addons into one named state map.
//!
//! ## Core Components
//!
//! - **Monitor**: wraps a target function, runs the per-call lifecycle and
//!   emits its events
//! - **Caller**: the exposed callable, with layerable middleware
//! - **Pipeline**: two-phase addon composition producing a [`Tracked`]
//!   function with name-bound output slots
//! - **Group**: keyed call-state partitions with scope-based debounced
//!   eviction
//!
//! ## Example
//!
//! ```rust
//! use calltrack_runtime::Pipeline;
//! use futures::FutureExt;
//! use futures::future;
//!
//! let tracked = Pipeline::new("double", |(n,): (u32,)| {
//!     future::ready(Ok::<_, String>(n * 2))
//! })
//! .build()
//! .unwrap();
//!
//! assert_eq!(tracked.call((21,)).now_or_never(), Some(Ok(42)));
//! assert!(!*tracked.loading().borrow());
//! ```

/// Addon contract and the two contribution phases
pub mod addon;

/// The exposed callable and its middleware layering
pub mod caller;

/// Keyed call-state partitions with scoped eviction
pub mod group;

/// Metric names and recorders
pub mod metrics;

/// Per-call lifecycle tracking around a target function
pub mod monitor;

/// Two-phase composition of a monitor, addons and a setup hook
pub mod pipeline;

/// Error types for pipeline construction
pub mod error {
    use thiserror::Error;

    /// Configuration errors raised while building a pipeline.
    ///
    /// These are setup-time failures: construction aborts entirely and no
    /// partially wired function is returned. Invocation failures are not
    /// represented here; they flow through the wrapped function's own
    /// error type.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum SetupError {
        /// The pipeline was given an empty instance name.
        #[error("instance name must not be empty")]
        EmptyName,

        /// The instance name contains the key placeholder token.
        ///
        /// Names are substituted *into* placeholder-bearing keys, so a
        /// name carrying the token itself would make binding ambiguous.
        #[error("instance name must not contain the key placeholder: {0:?}")]
        InvalidName(String),

        /// Two contributors produced the same output key after binding.
        ///
        /// Every offending key is listed. Collisions with the engine's own
        /// reserved output keys are reported the same way.
        #[error("duplicate output keys: {}", .0.join(", "))]
        DuplicateKeys(Vec<String>),
    }
}

pub use addon::{Addon, DeferredContribution, Install};
pub use caller::Caller;
pub use error::SetupError;
pub use group::{Group, GroupSnapshot, GroupState};
pub use metrics::register_metrics;
pub use monitor::{CallEvent, CallEventKind, CallFuture, InterceptFn, Monitor, TargetFn};
pub use pipeline::{Pipeline, SetupHook, Tracked};
