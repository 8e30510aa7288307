//! # Calltrack Testing
//!
//! Testing utilities and helpers for the calltrack engine.
//!
//! This crate provides:
//! - [`ControlledTarget`]: a target function whose per-call futures are
//!   resolved manually, for settling overlapping calls in any order
//! - [`Recorder`]: an addon that logs every lifecycle event in dispatch
//!   order, for asserting on event sequences
//!
//! ## Example
//!
//! ```ignore
//! use calltrack_runtime::Pipeline;
//! use calltrack_testing::{ControlledTarget, Recorder};
//!
//! #[tokio::test]
//! async fn fast_follow_up_wins() {
//!     let target = ControlledTarget::<(u32,), u32, String>::new();
//!     let recorder = Recorder::new();
//!     let tracked = Pipeline::new("query", target.target_fn())
//!         .addon(recorder.clone())
//!         .build()
//!         .unwrap();
//!
//!     let slow = tracked.call((1,));
//!     let fast = tracked.call((2,));
//!     target.fulfill(1, 20);
//!     target.fulfill(0, 10);
//!     assert_eq!(fast.await, Ok(20));
//!     assert_eq!(slow.await, Ok(10));
//! }
//! ```

/// Manually resolved target functions
pub mod controlled;

/// Lifecycle event logging addon
pub mod recorder;

pub use controlled::ControlledTarget;
pub use recorder::Recorder;
