//! A target function resolved by hand.
//!
//! Tests of overlapping calls need to decide which call finishes first.
//! [`ControlledTarget`] records every invocation's arguments and parks the
//! call on a one-shot channel until the test resolves it, so settlement
//! order is entirely under the test's control.

use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio::sync::oneshot;

struct PendingCall<A, T, E> {
    args: A,
    responder: Option<oneshot::Sender<Result<T, E>>>,
}

/// A target whose calls settle only when the test says so.
///
/// Calls are indexed in invocation order, starting at zero. A call that is
/// never resolved stays pending forever, which is also what happens when
/// the `ControlledTarget` itself is dropped first.
pub struct ControlledTarget<A, T, E> {
    calls: Arc<Mutex<Vec<PendingCall<A, T, E>>>>,
}

impl<A, T, E> ControlledTarget<A, T, E>
where
    A: Clone + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates a target with no recorded calls.
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The function to hand to a monitor or pipeline.
    #[must_use]
    pub fn target_fn(
        &self,
    ) -> impl Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync + 'static {
        let calls = Arc::clone(&self.calls);
        move |args: A| {
            let (responder, settled) = oneshot::channel();
            calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(PendingCall {
                    args,
                    responder: Some(responder),
                });
            async move {
                match settled.await {
                    Ok(result) => result,
                    Err(_) => future::pending().await,
                }
            }
            .boxed()
        }
    }

    /// Settles call number `call` with `result`.
    ///
    /// Returns `false` when the call does not exist, was already resolved,
    /// or its future was dropped before settling.
    pub fn resolve(&self, call: usize, result: Result<T, E>) -> bool {
        let responder = self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(call)
            .and_then(|pending| pending.responder.take());
        match responder {
            Some(responder) => responder.send(result).is_ok(),
            None => false,
        }
    }

    /// Settles call number `call` successfully.
    pub fn fulfill(&self, call: usize, value: T) -> bool {
        self.resolve(call, Ok(value))
    }

    /// Settles call number `call` with an error.
    pub fn reject(&self, call: usize, error: E) -> bool {
        self.resolve(call, Err(error))
    }

    /// Arguments the target received for call number `call`.
    #[must_use]
    pub fn args(&self, call: usize) -> Option<A> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(call)
            .map(|pending| pending.args.clone())
    }

    /// How many times the target has been invoked.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// How many recorded calls are still unresolved.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|pending| pending.responder.is_some())
            .count()
    }
}

impl<A, T, E> Clone for ControlledTarget<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<A, T, E> Default for ControlledTarget<A, T, E>
where
    A: Clone + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A, T, E> std::fmt::Debug for ControlledTarget<A, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ControlledTarget")
            .field("calls", &calls.len())
            .field(
                "pending",
                &calls.iter().filter(|c| c.responder.is_some()).count(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calltrack_runtime::Monitor;

    #[test]
    fn calls_settle_in_the_order_the_test_chooses() {
        let target = ControlledTarget::<(u32,), u32, String>::new();
        let monitor = Monitor::new(target.target_fn());

        let first = monitor.run((1,));
        let second = monitor.run((2,));
        assert_eq!(target.calls(), 2);
        assert_eq!(target.args(0), Some((1,)));
        assert_eq!(target.args(1), Some((2,)));

        assert!(target.fulfill(1, 20));
        assert_eq!(second.now_or_never(), Some(Ok(20)));
        assert!(target.reject(0, "late".to_string()));
        assert_eq!(first.now_or_never(), Some(Err("late".to_string())));
        assert_eq!(target.pending(), 0);
    }

    #[test]
    fn a_call_resolves_at_most_once() {
        let target = ControlledTarget::<(), u8, u8>::new();
        let monitor: Monitor<(), u8, u8> = Monitor::new(target.target_fn());

        let call = monitor.run(());
        assert!(target.fulfill(0, 1));
        assert!(!target.fulfill(0, 2));
        assert!(!target.fulfill(9, 3));
        assert_eq!(call.now_or_never(), Some(Ok(1)));
    }
}
