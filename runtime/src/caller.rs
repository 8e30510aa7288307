//! The invocable handle a built pipeline exposes.
//!
//! A [`Caller`] couples a [`Monitor`] with the function consumers actually
//! invoke. Freshly created it calls straight into [`Monitor::run`]; setup
//! hooks and privileged addons can [`Caller::wrap`] it with middleware
//! (debouncing, polling, precondition checks) without the engine knowing,
//! and every wrapped layer still funnels into the same tracked lifecycle.

use std::sync::Arc;

use calltrack_core::CallArgs;
use calltrack_core::event_bus::SubscriberId;

use crate::monitor::{CallEvent, CallEventKind, CallFuture, Monitor, TargetFn};

/// A wrapped, invocable tracked function.
pub struct Caller<A, T, E> {
    monitor: Monitor<A, T, E>,
    invoke: TargetFn<A, T, E>,
}

impl<A, T, E> Clone for Caller<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            monitor: self.monitor.clone(),
            invoke: Arc::clone(&self.invoke),
        }
    }
}

impl<A, T, E> std::fmt::Debug for Caller<A, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller")
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl<A, T, E> Caller<A, T, E>
where
    A: CallArgs,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// A caller that invokes `monitor` directly, with no middleware.
    #[must_use]
    pub fn from_monitor(monitor: Monitor<A, T, E>) -> Self {
        let run_target = monitor.clone();
        Self {
            monitor,
            invoke: Arc::new(move |args| run_target.run(args)),
        }
    }

    /// Invokes the function through every installed middleware layer.
    #[must_use = "the call future must be awaited to observe its result"]
    pub fn call(&self, args: A) -> CallFuture<T, E> {
        (self.invoke)(args)
    }

    /// Returns a caller with `middleware` layered on top of this one.
    ///
    /// The middleware receives the inner invocation function and the
    /// arguments; it decides whether and how to forward. Event
    /// subscriptions are unaffected, they live on the shared [`Monitor`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use calltrack_runtime::{Caller, Monitor};
    /// use futures::FutureExt;
    /// use futures::future;
    ///
    /// let monitor: Monitor<(u32,), u32, String> =
    ///     Monitor::new(|(n,): (u32,)| future::ready(Ok(n + 1)));
    /// let caller = Caller::from_monitor(monitor).wrap(|inner, (n,): (u32,)| {
    ///     if n == 0 {
    ///         // Short-circuit without ever starting a tracked call.
    ///         future::ready(Err("zero is not allowed".to_string())).boxed()
    ///     } else {
    ///         inner((n,))
    ///     }
    /// });
    ///
    /// assert_eq!(caller.call((0,)).now_or_never(), Some(Err("zero is not allowed".into())));
    /// assert_eq!(caller.call((41,)).now_or_never(), Some(Ok(42)));
    /// ```
    #[must_use]
    pub fn wrap<F>(&self, middleware: F) -> Self
    where
        F: Fn(&TargetFn<A, T, E>, A) -> CallFuture<T, E> + Send + Sync + 'static,
    {
        let inner = Arc::clone(&self.invoke);
        Self {
            monitor: self.monitor.clone(),
            invoke: Arc::new(move |args| middleware(&inner, args)),
        }
    }

    /// The monitor behind this caller.
    #[must_use]
    pub fn monitor(&self) -> &Monitor<A, T, E> {
        &self.monitor
    }

    /// Subscribes to a lifecycle event kind; see [`Monitor::on`].
    pub fn on<F>(&self, kind: CallEventKind, handler: F) -> SubscriberId
    where
        F: Fn(&CallEvent<A, T, E>) + Send + Sync + 'static,
    {
        self.monitor.on(kind, handler)
    }

    /// Removes a subscription; see [`Monitor::off`].
    pub fn off(&self, kind: CallEventKind, id: SubscriberId) -> bool {
        self.monitor.off(kind, id)
    }
}
