//! An addon that logs lifecycle events for assertions.

use std::sync::{Arc, Mutex, PoisonError};

use calltrack_core::{CallArgs, Contribution};
use calltrack_runtime::{Addon, CallEventKind, Install, Monitor};

/// Records every lifecycle event in dispatch order.
///
/// Install it as an addon (it contributes nothing) or [`attach`] it to a
/// bare monitor. Clones share one log, so tests keep a clone and hand the
/// recorder to the pipeline.
///
/// [`attach`]: Recorder::attach
#[derive(Clone, Default, Debug)]
pub struct Recorder {
    log: Arc<Mutex<Vec<(CallEventKind, u64)>>>,
}

const ALL_KINDS: [CallEventKind; 6] = [
    CallEventKind::Init,
    CallEventKind::Before,
    CallEventKind::After,
    CallEventKind::Fulfill,
    CallEventKind::Reject,
    CallEventKind::Updated,
];

impl Recorder {
    /// Creates a recorder with an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes the recorder to every event kind of `monitor`.
    pub fn attach<A, T, E>(&self, monitor: &Monitor<A, T, E>)
    where
        A: CallArgs,
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        for kind in ALL_KINDS {
            let log = Arc::clone(&self.log);
            monitor.on(kind, move |event| {
                log.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((kind, event.sn()));
            });
        }
    }

    /// Everything recorded so far, in dispatch order.
    #[must_use]
    pub fn events(&self) -> Vec<(CallEventKind, u64)> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Just the event kinds, in dispatch order.
    #[must_use]
    pub fn kinds(&self) -> Vec<CallEventKind> {
        self.events().into_iter().map(|(kind, _)| kind).collect()
    }

    /// The event kinds one call saw, in dispatch order.
    #[must_use]
    pub fn kinds_for(&self, sn: u64) -> Vec<CallEventKind> {
        self.events()
            .into_iter()
            .filter(|(_, event_sn)| *event_sn == sn)
            .map(|(kind, _)| kind)
            .collect()
    }

    /// Like [`kinds_for`], without the per-write `Updated` noise.
    ///
    /// [`kinds_for`]: Recorder::kinds_for
    #[must_use]
    pub fn lifecycle_for(&self, sn: u64) -> Vec<CallEventKind> {
        self.kinds_for(sn)
            .into_iter()
            .filter(|kind| *kind != CallEventKind::Updated)
            .collect()
    }

    /// Drains the log, returning what was recorded.
    pub fn take(&self) -> Vec<(CallEventKind, u64)> {
        std::mem::take(&mut *self.log.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<A, T, E> Addon<A, T, E> for Recorder
where
    A: CallArgs,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn install(&self, monitor: &Monitor<A, T, E>) -> Install<A, T, E> {
        self.attach(monitor);
        Install::Ready(Contribution::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use futures::future;

    #[test]
    fn one_call_sees_a_strictly_ordered_lifecycle() {
        let monitor: Monitor<(u32,), u32, String> =
            Monitor::new(|(n,): (u32,)| future::ready(Ok(n)));
        let recorder = Recorder::new();
        recorder.attach(&monitor);

        monitor.run((1,)).now_or_never();

        assert_eq!(
            recorder.lifecycle_for(1),
            vec![
                CallEventKind::Init,
                CallEventKind::Before,
                CallEventKind::After,
                CallEventKind::Fulfill,
            ]
        );
    }

    #[test]
    fn take_resets_the_log() {
        let monitor: Monitor<(u32,), u32, String> =
            Monitor::new(|(n,): (u32,)| future::ready(Ok(n)));
        let recorder = Recorder::new();
        recorder.attach(&monitor);

        monitor.run((1,)).now_or_never();
        assert!(!recorder.take().is_empty());
        assert!(recorder.events().is_empty());
    }
}
