//! Wrapping a target function with the call-tracking lifecycle.
//!
//! A [`Monitor`] owns one wrapped function. Every [`Monitor::run`] draws a
//! sequence number from the function's [`Tracker`], creates a [`Track`]
//! record, and walks a fixed event sequence:
//!
//! `Init` → `Before` → (argument interception) → target invoked → `After`
//! → exactly one of `Fulfill` | `Reject`
//!
//! The synchronous prefix of the target runs before `After` fires, so a
//! target built from an immediately ready future settles completely
//! (including its terminal event) before `run` returns. Engine bookkeeping
//! writes (arguments snapshot, loading flag, result value, error,
//! data-updated timestamp) go through reserved track keys, and every such
//! write is re-broadcast as an `Updated` event so downstream state can
//! recompute without knowing which write caused it.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use calltrack_core::event_bus::{BusEvent, EventBus, SubscriberId};
use calltrack_core::key::{SharedKey, TrackValue, track_value};
use calltrack_core::track::{ReservedKeys, Track, TrackHandle};
use calltrack_core::tracker::{Outcome, Tracker};
use calltrack_core::CallArgs;
use chrono::Utc;
use futures::FutureExt;
use futures::future::{self, BoxFuture};

use crate::metrics::CallMetrics;

/// Future returned by [`Monitor::run`] and by wrapped callables.
pub type CallFuture<T, E> = BoxFuture<'static, Result<T, E>>;

/// The wrapped target function, type-erased.
pub type TargetFn<A, T, E> = Arc<dyn Fn(A) -> CallFuture<T, E> + Send + Sync>;

/// Single-slot argument interceptor; `None` keeps the original arguments.
pub type InterceptFn<A> = Arc<dyn Fn(&A, &TrackHandle) -> Option<A> + Send + Sync>;

/// Discriminant of a [`CallEvent`], used to key subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEventKind {
    /// A call record was created.
    Init,
    /// The target is about to be invoked.
    Before,
    /// The target's synchronous portion has finished.
    After,
    /// The call settled with a value.
    Fulfill,
    /// The call settled with an error.
    Reject,
    /// A reserved or shared track key changed.
    Updated,
}

/// Lifecycle event emitted by a [`Monitor`].
pub enum CallEvent<A, T, E> {
    /// A call record was created; carries the caller's arguments.
    Init {
        /// Arguments the call was made with.
        args: A,
        /// The new call's record.
        handle: TrackHandle,
    },
    /// The target is about to be invoked.
    Before {
        /// Arguments the call was made with (pre-interception).
        args: A,
        /// The call's record.
        handle: TrackHandle,
    },
    /// The target's synchronous portion has finished.
    After {
        /// The call's record.
        handle: TrackHandle,
    },
    /// The call settled with a value.
    Fulfill {
        /// The settled value.
        value: T,
        /// The call's record, already terminal.
        handle: TrackHandle,
    },
    /// The call settled with an error.
    Reject {
        /// The settled error.
        error: E,
        /// The call's record, already terminal.
        handle: TrackHandle,
    },
    /// An aliased track key changed; fired for every engine bookkeeping
    /// write and for addon writes to keys they shared themselves.
    Updated {
        /// Shared alias of the key that changed.
        key: SharedKey,
        /// The new value, `None` when the key was deleted.
        value: Option<TrackValue>,
        /// The record the change belongs to.
        handle: TrackHandle,
    },
}

impl<A, T, E> CallEvent<A, T, E> {
    /// The record this event belongs to.
    #[must_use]
    pub const fn handle(&self) -> &TrackHandle {
        match self {
            Self::Init { handle, .. }
            | Self::Before { handle, .. }
            | Self::After { handle }
            | Self::Fulfill { handle, .. }
            | Self::Reject { handle, .. }
            | Self::Updated { handle, .. } => handle,
        }
    }

    /// Sequence number of the call this event belongs to.
    #[must_use]
    pub fn sn(&self) -> u64 {
        self.handle().sn()
    }
}

impl<A, T, E> BusEvent for CallEvent<A, T, E> {
    type Kind = CallEventKind;

    fn kind(&self) -> Self::Kind {
        match self {
            Self::Init { .. } => CallEventKind::Init,
            Self::Before { .. } => CallEventKind::Before,
            Self::After { .. } => CallEventKind::After,
            Self::Fulfill { .. } => CallEventKind::Fulfill,
            Self::Reject { .. } => CallEventKind::Reject,
            Self::Updated { .. } => CallEventKind::Updated,
        }
    }
}

impl<A, T, E> std::fmt::Debug for CallEvent<A, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEvent")
            .field("kind", &self.kind())
            .field("sn", &self.sn())
            .finish_non_exhaustive()
    }
}

struct MonitorInner<A, T, E> {
    target: TargetFn<A, T, E>,
    tracker: Arc<Tracker>,
    reserved: Arc<ReservedKeys>,
    bus: EventBus<CallEvent<A, T, E>>,
    interceptor: Mutex<Option<InterceptFn<A>>>,
}

/// Wraps a target function so every invocation is tracked.
///
/// Cloning is cheap; all clones drive the same tracker, reserved keys and
/// event bus. Overlapping invocations each get their own [`Track`] record,
/// and the [`Tracker`]'s latest-wins bookkeeping decides which settlement
/// is authoritative when they finish out of order.
///
/// # Example
///
/// ```rust
/// use calltrack_runtime::Monitor;
/// use futures::FutureExt;
///
/// let monitor: Monitor<(u32,), u32, String> =
///     Monitor::new(|(n,): (u32,)| futures::future::ready(Ok(n * 2)));
///
/// // The target is immediately ready, so the call settles synchronously.
/// let outcome = monitor.run((21,)).now_or_never();
/// assert_eq!(outcome, Some(Ok(42)));
/// ```
pub struct Monitor<A, T, E> {
    inner: Arc<MonitorInner<A, T, E>>,
}

impl<A, T, E> Clone for Monitor<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T, E> std::fmt::Debug for Monitor<A, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("last_sn", &self.inner.tracker.last_sn())
            .finish_non_exhaustive()
    }
}

impl<A, T, E> Monitor<A, T, E>
where
    A: CallArgs,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Wraps `target`.
    ///
    /// Synchronous functions are wrapped by returning an immediately ready
    /// future, e.g. `|args| futures::future::ready(compute(args))`.
    #[must_use]
    pub fn new<F, Fut>(target: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::from_target(Arc::new(move |args: A| target(args).boxed()))
    }

    /// Wraps an already boxed target.
    #[must_use]
    pub fn from_target(target: TargetFn<A, T, E>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                target,
                tracker: Arc::new(Tracker::new()),
                reserved: Arc::new(ReservedKeys::new()),
                bus: EventBus::new(),
                interceptor: Mutex::new(None),
            }),
        }
    }

    /// Subscribes `handler` to one lifecycle event kind.
    pub fn on<F>(&self, kind: CallEventKind, handler: F) -> SubscriberId
    where
        F: Fn(&CallEvent<A, T, E>) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, handler)
    }

    /// Removes a subscription; returns whether it was present.
    pub fn off(&self, kind: CallEventKind, id: SubscriberId) -> bool {
        self.inner.bus.off(kind, id)
    }

    /// Installs the argument interceptor, replacing any previous one.
    ///
    /// The interceptor runs after `Before` and before the target is
    /// invoked, invisibly to event subscribers. Returning `None` keeps the
    /// original arguments. The stored arguments snapshot always records
    /// what the caller passed, not what the interceptor produced.
    pub fn intercept_arguments<F>(&self, interceptor: F)
    where
        F: Fn(&A, &TrackHandle) -> Option<A> + Send + Sync + 'static,
    {
        let mut slot = self
            .inner
            .interceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            tracing::debug!("replacing installed argument interceptor");
        }
        *slot = Some(Arc::new(interceptor));
    }

    /// The engine's reserved track keys for this function.
    #[must_use]
    pub fn reserved(&self) -> &Arc<ReservedKeys> {
        &self.inner.reserved
    }

    /// The sequence counter shared by all calls of this function.
    #[must_use]
    pub fn tracker(&self) -> &Tracker {
        &self.inner.tracker
    }

    /// Invokes the wrapped function as one tracked call.
    ///
    /// The full lifecycle up to `After` (including the target's
    /// synchronous prefix) runs before this method returns; if the target
    /// is already settled at that point, the terminal bookkeeping and
    /// `Fulfill`/`Reject` event run synchronously too and the returned
    /// future is immediately ready. Dropping the future without awaiting
    /// it abandons a still-pending call: its record stays pending and no
    /// terminal event ever fires for it.
    #[must_use = "the call future must be awaited to observe its result"]
    pub fn run(&self, args: A) -> CallFuture<T, E> {
        let inner = Arc::clone(&self.inner);
        let started = Instant::now();
        let sn = inner.tracker.next_sn();
        let track = Arc::new(Track::new(sn, Arc::clone(&inner.tracker)));
        inner.reserved.install(&track);
        let handle = TrackHandle::new(Arc::clone(&track), Arc::clone(&inner.reserved));

        // Re-broadcast every aliased-key write as an Updated event. The
        // observer holds the record weakly; the record must not keep
        // itself alive through its own observer list.
        {
            let weak = Arc::downgrade(&track);
            let observer_inner = Arc::clone(&inner);
            track.on_data_change(move |key, value| {
                if let Some(track) = weak.upgrade() {
                    let handle =
                        TrackHandle::new(track, Arc::clone(&observer_inner.reserved));
                    observer_inner.bus.emit(&CallEvent::Updated {
                        key,
                        value: value.cloned(),
                        handle,
                    });
                }
            });
        }

        tracing::debug!(sn, "call started");
        CallMetrics::record_start();

        inner.bus.emit(&CallEvent::Init {
            args: args.clone(),
            handle: handle.clone(),
        });
        track.set_data(inner.reserved.arguments(), Some(track_value(args.clone())));
        track.set_data(inner.reserved.loading(), Some(track_value(true)));
        inner.bus.emit(&CallEvent::Before {
            args: args.clone(),
            handle: handle.clone(),
        });

        let args = {
            let interceptor = inner
                .interceptor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match interceptor {
                Some(intercept) => intercept(&args, &handle).unwrap_or(args),
                None => args,
            }
        };

        let mut call = (inner.target)(args);
        let early = poll_now(&mut call);
        inner.bus.emit(&CallEvent::After { handle });

        match early {
            Some(result) => {
                let result = Self::settle(&inner, &track, started, result);
                future::ready(result).boxed()
            }
            None => async move {
                let result = call.await;
                Self::settle(&inner, &track, started, result)
            }
            .boxed(),
        }
    }

    fn settle(
        inner: &Arc<MonitorInner<A, T, E>>,
        track: &Arc<Track>,
        started: Instant,
        result: Result<T, E>,
    ) -> Result<T, E> {
        let reserved = &inner.reserved;
        let handle = TrackHandle::new(Arc::clone(track), Arc::clone(reserved));
        match &result {
            Ok(value) => {
                if track.fulfill() {
                    track.set_data(reserved.data(), Some(track_value(value.clone())));
                    track.set_data(reserved.data_updated(), Some(track_value(Utc::now())));
                    track.set_data(reserved.loading(), Some(track_value(false)));
                    track.set_data(reserved.arguments(), None);
                    let stale = !track.is_latest(Some(Outcome::Fulfilled));
                    CallMetrics::record_fulfill(started.elapsed(), stale);
                    tracing::debug!(sn = track.sn(), stale, "call fulfilled");
                    inner.bus.emit(&CallEvent::Fulfill {
                        value: value.clone(),
                        handle,
                    });
                }
            }
            Err(error) => {
                if track.reject() {
                    track.set_data(reserved.error(), Some(track_value(error.clone())));
                    track.set_data(reserved.loading(), Some(track_value(false)));
                    track.set_data(reserved.arguments(), None);
                    let stale = !track.is_latest(Some(Outcome::Rejected));
                    CallMetrics::record_reject(started.elapsed(), stale);
                    tracing::debug!(sn = track.sn(), stale, "call rejected");
                    inner.bus.emit(&CallEvent::Reject {
                        error: error.clone(),
                        handle,
                    });
                }
            }
        }
        result
    }
}

/// Polls once with a no-op waker, preserving the future when it is not
/// ready yet.
fn poll_now<T>(future: &mut BoxFuture<'static, T>) -> Option<T> {
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(value) => Some(value),
        Poll::Pending => None,
    }
}
