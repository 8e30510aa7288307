//! Assembling a wrapped function and its addons into one named state map.
//!
//! [`Pipeline`] drives the two-phase composition described in
//! [`crate::addon`]: phase one installs every addon against the bare
//! [`Monitor`], the optional setup hook wraps the callable, phase two runs
//! deferred contributions against the final [`Caller`], and the merged
//! output keys are bound to the instance name. Key collisions abort the
//! build; nothing is ever silently overwritten.
//!
//! The built [`Tracked`] exposes the callable plus four observable cells
//! (loading, arguments, first argument, error) fed from lifecycle events
//! with latest-wins resolution, alongside every addon's named slots.

use std::future::Future;
use std::sync::Arc;

use calltrack_core::CallArgs;
use calltrack_core::contribution::{Contribution, StateMap, duplicate_keys};
use calltrack_core::key::{TrackValue, value_as};
use calltrack_core::naming::{PLACEHOLDER, rewrite_key};
use calltrack_core::tracker::Outcome;
use tokio::sync::watch;

use crate::addon::{Addon, DeferredContribution, Install};
use crate::caller::Caller;
use crate::error::SetupError;
use crate::metrics::PipelineMetrics;
use crate::monitor::{CallEvent, CallEventKind, CallFuture, Monitor};

const LOADING_KEY: &str = "{name}Loading";
const ARGUMENTS_KEY: &str = "{name}Arguments";
const ARGUMENT_KEY: &str = "{name}Argument";
const ERROR_KEY: &str = "{name}Error";

/// Final-wrapping hook applied between phase one and phase two.
///
/// Receives the monitor-backed caller and may return a wrapped
/// replacement; `None` keeps the caller unchanged.
pub type SetupHook<A, T, E> =
    Box<dyn FnOnce(Caller<A, T, E>) -> Option<Caller<A, T, E>> + Send>;

/// Builder for a tracked function with addons.
///
/// # Example
///
/// ```rust
/// use calltrack_core::Contribution;
/// use calltrack_runtime::{Install, Monitor, Pipeline};
/// use futures::FutureExt;
/// use futures::future;
///
/// let tracked = Pipeline::new("user", |(id,): (u32,)| {
///     future::ready(if id == 0 { Err("unknown user".to_string()) } else { Ok(id * 10) })
/// })
/// .addon(|_: &Monitor<(u32,), u32, String>| {
///     Install::Ready(Contribution::new().with("{name}Source", "directory"))
/// })
/// .build()
/// .unwrap();
///
/// assert_eq!(tracked.call((4,)).now_or_never(), Some(Ok(40)));
/// assert_eq!(tracked.state::<&str>("userSource"), Some(&"directory"));
/// # assert!(tracked.keys().contains(&"userLoading".to_string()));
/// ```
pub struct Pipeline<A, T, E> {
    name: String,
    monitor: Monitor<A, T, E>,
    addons: Vec<Box<dyn Addon<A, T, E>>>,
    setup: Option<SetupHook<A, T, E>>,
}

impl<A, T, E> Pipeline<A, T, E>
where
    A: CallArgs,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Starts a pipeline for `target` under the instance name `name`.
    #[must_use]
    pub fn new<F, Fut>(name: impl Into<String>, target: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::from_monitor(name, Monitor::new(target))
    }

    /// Starts a pipeline over an existing monitor.
    #[must_use]
    pub fn from_monitor(name: impl Into<String>, monitor: Monitor<A, T, E>) -> Self {
        Self {
            name: name.into(),
            monitor,
            addons: Vec::new(),
            setup: None,
        }
    }

    /// Appends an addon; install order is phase-one execution order and
    /// contribution merge order.
    #[must_use]
    pub fn addon(mut self, addon: impl Addon<A, T, E> + 'static) -> Self {
        self.addons.push(Box::new(addon));
        self
    }

    /// Sets the final-wrapping hook.
    #[must_use]
    pub fn setup<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(Caller<A, T, E>) -> Option<Caller<A, T, E>> + Send + 'static,
    {
        self.setup = Some(Box::new(hook));
        self
    }

    /// Runs both composition phases and returns the assembled function.
    ///
    /// # Errors
    ///
    /// Returns a [`SetupError`] when the instance name is unusable or when
    /// two contributors (addons or the engine's own reserved outputs)
    /// produce the same key after name binding. A failed build installs
    /// nothing usable; event subscriptions made during phase one are left
    /// on the monitor but no callable is returned.
    pub fn build(self) -> Result<Tracked<A, T, E>, SetupError> {
        let Self {
            name,
            monitor,
            addons,
            setup,
        } = self;

        if name.is_empty() {
            PipelineMetrics::record_build_failure();
            return Err(SetupError::EmptyName);
        }
        if name.contains(PLACEHOLDER) {
            PipelineMetrics::record_build_failure();
            return Err(SetupError::InvalidName(name));
        }

        let cells = Cells::install(&monitor);

        // Phase one: classify every addon's result, keeping its merge slot.
        let mut contributions: Vec<Option<Contribution>> = Vec::with_capacity(addons.len());
        let mut deferred: Vec<(usize, DeferredContribution<A, T, E>)> = Vec::new();
        for addon in &addons {
            match addon.install(&monitor) {
                Install::Ready(contribution) => contributions.push(Some(contribution)),
                Install::Deferred(finish) => {
                    deferred.push((contributions.len(), finish));
                    contributions.push(None);
                }
            }
        }

        // Assemble the callable, then phase two against the final form.
        let caller = Caller::from_monitor(monitor);
        let caller = match setup {
            Some(hook) => {
                let fallback = caller.clone();
                hook(caller).unwrap_or(fallback)
            }
            None => caller,
        };
        for (slot, finish) in deferred {
            contributions[slot] = Some(finish(&caller));
        }

        // Bind every output key to the instance name, engine slots first.
        let mut bound: Vec<(String, TrackValue)> = Vec::new();
        let engine_slots: [(&str, TrackValue); 5] = [
            (PLACEHOLDER, Arc::new(caller.clone())),
            (LOADING_KEY, Arc::new(cells.loading.clone())),
            (ARGUMENTS_KEY, Arc::new(cells.arguments.clone())),
            (ARGUMENT_KEY, Arc::new(cells.argument.clone())),
            (ERROR_KEY, Arc::new(cells.error.clone())),
        ];
        for (template, value) in engine_slots {
            if let Some(key) = rewrite_key(template, &name) {
                bound.push((key, value));
            }
        }
        for contribution in contributions.into_iter().flatten() {
            for (template, value) in contribution.into_entries() {
                match rewrite_key(&template, &name) {
                    Some(key) => bound.push((key, value)),
                    None => {
                        tracing::debug!(
                            name,
                            key = template,
                            "dropping contributed key without name placeholder"
                        );
                    }
                }
            }
        }

        let duplicates = duplicate_keys(bound.iter().map(|(key, _)| key.as_str()));
        if !duplicates.is_empty() {
            PipelineMetrics::record_build_failure();
            return Err(SetupError::DuplicateKeys(duplicates));
        }

        let mut state = StateMap::new();
        for (key, value) in bound {
            state.insert(key, value);
        }

        tracing::debug!(name, slots = state.len(), "pipeline built");
        PipelineMetrics::record_build();

        Ok(Tracked {
            name,
            caller,
            loading: cells.loading,
            arguments: cells.arguments,
            argument: cells.argument,
            error: cells.error,
            state,
        })
    }
}

/// A built pipeline: the wrapped callable plus its merged named state.
pub struct Tracked<A: CallArgs, T, E> {
    name: String,
    caller: Caller<A, T, E>,
    loading: watch::Receiver<bool>,
    arguments: watch::Receiver<Option<A>>,
    argument: watch::Receiver<Option<A::Head>>,
    error: watch::Receiver<Option<E>>,
    state: StateMap,
}

impl<A, T, E> Tracked<A, T, E>
where
    A: CallArgs,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// The instance name the output keys were bound to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the wrapped function through all middleware layers.
    #[must_use = "the call future must be awaited to observe its result"]
    pub fn call(&self, args: A) -> CallFuture<T, E> {
        self.caller.call(args)
    }

    /// The wrapped callable itself.
    #[must_use]
    pub fn caller(&self) -> &Caller<A, T, E> {
        &self.caller
    }

    /// Whether the latest call is still in flight.
    #[must_use]
    pub fn loading(&self) -> watch::Receiver<bool> {
        self.loading.clone()
    }

    /// Arguments snapshot of the latest in-flight call.
    #[must_use]
    pub fn arguments(&self) -> watch::Receiver<Option<A>> {
        self.arguments.clone()
    }

    /// First argument of the latest in-flight call.
    #[must_use]
    pub fn argument(&self) -> watch::Receiver<Option<A::Head>> {
        self.argument.clone()
    }

    /// Error of the latest settled call, when it rejected.
    #[must_use]
    pub fn error(&self) -> watch::Receiver<Option<E>> {
        self.error.clone()
    }

    /// Typed read of a named output slot.
    #[must_use]
    pub fn state<S: Send + Sync + 'static>(&self, key: &str) -> Option<&S> {
        self.state.get::<S>(key)
    }

    /// All bound output keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.state.keys()
    }
}

impl<A: CallArgs, T, E> std::fmt::Debug for Tracked<A, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracked")
            .field("name", &self.name)
            .field("keys", &self.state.keys())
            .finish_non_exhaustive()
    }
}

struct Cells<A: CallArgs, E> {
    loading: watch::Receiver<bool>,
    arguments: watch::Receiver<Option<A>>,
    argument: watch::Receiver<Option<A::Head>>,
    error: watch::Receiver<Option<E>>,
}

impl<A, E> Cells<A, E>
where
    A: CallArgs,
    E: Clone + Send + Sync + 'static,
{
    /// Wires the four reserved cells to lifecycle events.
    ///
    /// Loading and arguments follow the most recently created call; a
    /// superseded call's writes are ignored. The error cell reflects the
    /// latest settled call: set when it rejected, cleared when it
    /// fulfilled.
    fn install<T>(monitor: &Monitor<A, T, E>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let (loading_tx, loading) = watch::channel(false);
        let (arguments_tx, arguments) = watch::channel(None::<A>);
        let (argument_tx, argument) = watch::channel(None::<A::Head>);
        let (error_tx, error) = watch::channel(None::<E>);
        let error_tx = Arc::new(error_tx);

        let reserved = Arc::clone(monitor.reserved());
        monitor.on(CallEventKind::Updated, move |event| {
            let CallEvent::Updated { key, value, handle } = event else {
                return;
            };
            if !handle.is_latest(None) {
                return;
            }
            if *key == reserved.loading_shared() {
                let next = value
                    .as_ref()
                    .and_then(value_as::<bool>)
                    .copied()
                    .unwrap_or(false);
                loading_tx.send_replace(next);
            } else if *key == reserved.arguments_shared() {
                let next = value.as_ref().and_then(value_as::<A>).cloned();
                argument_tx.send_replace(next.as_ref().and_then(CallArgs::head));
                arguments_tx.send_replace(next);
            }
        });

        let set_error = Arc::clone(&error_tx);
        monitor.on(CallEventKind::Reject, move |event| {
            let CallEvent::Reject { error, handle } = event else {
                return;
            };
            if handle.is_latest(Some(Outcome::Rejected)) && !handle.has_later(None) {
                set_error.send_replace(Some(error.clone()));
            }
        });
        monitor.on(CallEventKind::Fulfill, move |event| {
            let CallEvent::Fulfill { handle, .. } = event else {
                return;
            };
            if handle.is_latest(Some(Outcome::Fulfilled)) && !handle.has_later(None) {
                error_tx.send_replace(None);
            }
        });

        Self {
            loading,
            arguments,
            argument,
            error,
        }
    }
}
