//! The two-phase addon capability contract.
//!
//! An addon attaches behavior and named state to a wrapped function. Phase
//! one runs at pipeline build time against the bare [`Monitor`]: the addon
//! subscribes to lifecycle events and either hands back its output slots
//! immediately ([`Install::Ready`]) or defers until the fully assembled
//! callable exists ([`Install::Deferred`]), which is how privileged addons
//! get hold of the final, middleware-wrapped [`Caller`]. Deferred closures
//! run in phase two, after every addon's phase one and after the setup
//! hook has wrapped the callable.

use calltrack_core::Contribution;

use crate::caller::Caller;
use crate::monitor::Monitor;

/// Phase-two closure, invoked with the final wrapped callable.
pub type DeferredContribution<A, T, E> =
    Box<dyn FnOnce(&Caller<A, T, E>) -> Contribution + Send>;

/// What an addon's phase one produced.
pub enum Install<A, T, E> {
    /// Output slots available immediately.
    Ready(Contribution),
    /// Output slots that need the final callable; runs in phase two.
    Deferred(DeferredContribution<A, T, E>),
}

impl<A, T, E> std::fmt::Debug for Install<A, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(contribution) => f.debug_tuple("Ready").field(contribution).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// A composable unit contributing state and lifecycle behavior to a
/// wrapped function.
///
/// Closures of the right shape implement this automatically:
///
/// ```rust
/// use calltrack_core::Contribution;
/// use calltrack_runtime::{Addon, Install, Monitor};
///
/// fn version_addon<A, T, E>() -> impl Addon<A, T, E> {
///     |_monitor: &Monitor<A, T, E>| {
///         Install::Ready(Contribution::new().with("{name}EngineVersion", 3_u32))
///     }
/// }
/// ```
pub trait Addon<A, T, E>: Send + Sync {
    /// Phase one: observe the monitor and produce output slots, either
    /// immediately or deferred to phase two.
    fn install(&self, monitor: &Monitor<A, T, E>) -> Install<A, T, E>;
}

impl<A, T, E, F> Addon<A, T, E> for F
where
    F: Fn(&Monitor<A, T, E>) -> Install<A, T, E> + Send + Sync,
{
    fn install(&self, monitor: &Monitor<A, T, E>) -> Install<A, T, E> {
        self(monitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future;

    #[test]
    fn closures_are_addons() {
        let monitor: Monitor<(), u32, String> = Monitor::new(|()| future::ready(Ok(1)));
        let addon = |_: &Monitor<(), u32, String>| {
            Install::Ready(Contribution::new().with("{name}Marker", true))
        };
        match addon.install(&monitor) {
            Install::Ready(contribution) => assert_eq!(contribution.len(), 1),
            Install::Deferred(_) => unreachable!("addon returned a ready contribution"),
        }
    }

    #[test]
    fn deferred_contributions_wait_for_the_caller() {
        let monitor: Monitor<(), u32, String> = Monitor::new(|()| future::ready(Ok(1)));
        let addon = |_: &Monitor<(), u32, String>| {
            Install::Deferred(Box::new(|caller: &Caller<(), u32, String>| {
                Contribution::new().with("{name}Invoke", caller.clone())
            }) as DeferredContribution<(), u32, String>)
        };

        let caller = Caller::from_monitor(monitor.clone());
        match addon.install(&monitor) {
            Install::Deferred(finish) => {
                let contribution = finish(&caller);
                assert_eq!(contribution.len(), 1);
            }
            Install::Ready(_) => unreachable!("addon deferred its contribution"),
        }
    }
}
