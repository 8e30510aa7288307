//! Per-key call-state partitions with scope-based eviction.
//!
//! [`Group`] is an addon that derives a string key from each call's
//! arguments and maintains an independent projection of call state per
//! key. Two calls with different keys never touch each other's partition,
//! and within one partition the same latest-wins discipline applies as for
//! the global state: a settlement lands only if no later call for the same
//! key has already finished.
//!
//! An optional scope deriver groups partitions. When a call switches the
//! active scope, all partitions of the previous scope are scheduled for
//! eviction after a debounce delay; a call reusing that scope inside the
//! window cancels the eviction. There is one timer per group, so only the
//! most recent scope transition is ever honored.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use calltrack_core::CallArgs;
use calltrack_core::contribution::Contribution;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::addon::{Addon, Install};
use crate::metrics::GroupMetrics;
use crate::monitor::{CallEvent, CallEventKind, Monitor};

const DEFAULT_CLEAR_DELAY: Duration = Duration::from_millis(100);

type DeriveFn<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;

/// Addon that partitions call state by a derived key.
///
/// # Example
///
/// ```rust
/// use calltrack_runtime::{Group, GroupState, Pipeline};
/// use futures::FutureExt;
/// use futures::future;
///
/// let tracked = Pipeline::new("page", |(id,): (u32,)| {
///     future::ready(Ok::<_, String>(id * 10))
/// })
/// .addon(Group::new(|(id,): &(u32,)| *id))
/// .build()
/// .unwrap();
///
/// tracked.call((1,)).now_or_never();
/// tracked.call((2,)).now_or_never();
///
/// let groups = tracked
///     .state::<GroupState<(u32,), u32, String>>("pageGroup")
///     .unwrap();
/// assert_eq!(groups.keys(), vec!["1", "2"]);
/// assert_eq!(groups.snapshot("1").and_then(|s| s.data), Some(10));
/// assert_eq!(groups.snapshot("2").and_then(|s| s.data), Some(20));
/// ```
pub struct Group<A> {
    key_fn: DeriveFn<A>,
    scope_fn: Option<DeriveFn<A>>,
    clear_auto_delay: Duration,
}

impl<A> Group<A> {
    /// Creates a group keyed by `key`, string-coercing its result.
    #[must_use]
    pub fn new<K, F>(key: F) -> Self
    where
        F: Fn(&A) -> K + Send + Sync + 'static,
        K: fmt::Display,
    {
        Self {
            key_fn: Arc::new(move |args| key(args).to_string()),
            scope_fn: None,
            clear_auto_delay: DEFAULT_CLEAR_DELAY,
        }
    }

    /// Adds a scope deriver.
    ///
    /// When a call's scope differs from the previous call's, every
    /// partition still tagged with the previous scope is evicted after the
    /// debounce delay, unless a call reuses that scope first.
    #[must_use]
    pub fn scope<S, F>(mut self, scope: F) -> Self
    where
        F: Fn(&A) -> S + Send + Sync + 'static,
        S: fmt::Display,
    {
        self.scope_fn = Some(Arc::new(move |args| scope(args).to_string()));
        self
    }

    /// Overrides the eviction debounce delay (default 100 ms).
    ///
    /// The delay needs a Tokio runtime on the calling thread; without one,
    /// scope eviction degrades to immediate, synchronous removal.
    #[must_use]
    pub fn clear_auto_delay(mut self, delay: Duration) -> Self {
        self.clear_auto_delay = delay;
        self
    }
}

impl<A> fmt::Debug for Group<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("scoped", &self.scope_fn.is_some())
            .field("clear_auto_delay", &self.clear_auto_delay)
            .finish_non_exhaustive()
    }
}

impl<A, T, E> Addon<A, T, E> for Group<A>
where
    A: CallArgs,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn install(&self, monitor: &Monitor<A, T, E>) -> Install<A, T, E> {
        let core = Arc::new(GroupCore {
            key_fn: Arc::clone(&self.key_fn),
            scope_fn: self.scope_fn.clone(),
            clear_auto_delay: self.clear_auto_delay,
            inner: Mutex::new(GroupInner {
                partitions: HashMap::new(),
                routes: HashMap::new(),
                active_scope: None,
                eviction: None,
            }),
        });

        let on_init = Arc::clone(&core);
        monitor.on(CallEventKind::Init, move |event| {
            if let CallEvent::Init { args, handle } = event {
                GroupCore::begin(&on_init, handle.sn(), args);
            }
        });
        let on_fulfill = Arc::clone(&core);
        monitor.on(CallEventKind::Fulfill, move |event| {
            if let CallEvent::Fulfill { value, handle } = event {
                on_fulfill.settle_ok(handle.sn(), value);
            }
        });
        let on_reject = Arc::clone(&core);
        monitor.on(CallEventKind::Reject, move |event| {
            if let CallEvent::Reject { error, handle } = event {
                on_reject.settle_err(handle.sn(), error);
            }
        });

        Install::Ready(Contribution::new().with("{name}Group", GroupState { core }))
    }
}

/// One partition's current projection of call state.
#[derive(Clone)]
pub struct GroupSnapshot<A: CallArgs, T, E> {
    /// Whether the newest call routed to this key is still in flight.
    pub loading: bool,
    /// Error of the latest settled call for this key, when it rejected.
    pub error: Option<E>,
    /// Arguments of the newest in-flight call for this key.
    pub arguments: Option<A>,
    /// First argument of the newest in-flight call for this key.
    pub argument: Option<A::Head>,
    /// Value of the latest fulfilled call for this key.
    pub data: Option<T>,
    /// Whether `data` predates a call that has since started for this key.
    pub data_expired: bool,
}

impl<A: CallArgs, T, E> Default for GroupSnapshot<A, T, E> {
    fn default() -> Self {
        Self {
            loading: false,
            error: None,
            arguments: None,
            argument: None,
            data: None,
            data_expired: false,
        }
    }
}

impl<A: CallArgs, T, E> fmt::Debug for GroupSnapshot<A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupSnapshot")
            .field("loading", &self.loading)
            .field("has_data", &self.data.is_some())
            .field("has_error", &self.error.is_some())
            .field("data_expired", &self.data_expired)
            .finish_non_exhaustive()
    }
}

struct Partition<A: CallArgs, T, E> {
    scope: Option<String>,
    newest_sn: u64,
    settled_sn: u64,
    /// Sequence numbers routed here that have not settled yet.
    pending: Vec<u64>,
    tx: watch::Sender<GroupSnapshot<A, T, E>>,
}

impl<A: CallArgs, T, E> Partition<A, T, E> {
    fn new() -> Self {
        let (tx, _) = watch::channel(GroupSnapshot::default());
        Self {
            scope: None,
            newest_sn: 0,
            settled_sn: 0,
            pending: Vec::new(),
            tx,
        }
    }
}

struct GroupInner<A: CallArgs, T, E> {
    partitions: HashMap<String, Partition<A, T, E>>,
    routes: HashMap<u64, String>,
    active_scope: Option<String>,
    eviction: Option<JoinHandle<()>>,
}

struct GroupCore<A: CallArgs, T, E> {
    key_fn: DeriveFn<A>,
    scope_fn: Option<DeriveFn<A>>,
    clear_auto_delay: Duration,
    inner: Mutex<GroupInner<A, T, E>>,
}

impl<A: CallArgs, T, E> GroupCore<A, T, E> {
    // Needs no payload bounds; the Debug impls rely on that.
    fn lock(&self) -> std::sync::MutexGuard<'_, GroupInner<A, T, E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A, T, E> GroupCore<A, T, E>
where
    A: CallArgs,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn begin(core: &Arc<Self>, sn: u64, args: &A) {
        let key = (core.key_fn)(args);
        let scope = core.scope_fn.as_ref().map(|derive| derive(args));

        let mut inner = core.lock();
        inner.routes.insert(sn, key.clone());

        let partition = inner.partitions.entry(key.clone()).or_insert_with(|| {
            GroupMetrics::record_partition_created();
            tracing::debug!(key, "group partition created");
            Partition::new()
        });
        // Sequence numbers are monotonic, so a starting call is always the
        // partition's newest; it also retags the partition to its scope.
        partition.newest_sn = sn;
        partition.pending.push(sn);
        partition.scope = scope.clone();
        partition.tx.send_modify(|snapshot| {
            if snapshot.data.is_some() {
                snapshot.data_expired = true;
            }
            snapshot.loading = true;
            snapshot.arguments = Some(args.clone());
            snapshot.argument = args.head();
        });

        if core.scope_fn.is_some() && inner.active_scope != scope {
            if let Some(timer) = inner.eviction.take() {
                timer.abort();
            }
            if let Some(stale) = inner.active_scope.take() {
                Self::schedule_eviction(core, &mut inner, stale);
            }
            inner.active_scope = scope;
        }
    }

    /// Arms the single eviction timer for `stale`, or evicts on the spot
    /// when no runtime is available to run the timer.
    ///
    /// The deadline is fixed here, at the scope-changing call, not at the
    /// spawned task's first poll: the previous scope's partitions survive
    /// exactly `clear_auto_delay` past the call that displaced them.
    fn schedule_eviction(core: &Arc<Self>, inner: &mut GroupInner<A, T, E>, stale: String) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let weak = Arc::downgrade(core);
                let deadline = tokio::time::Instant::now() + core.clear_auto_delay;
                inner.eviction = Some(runtime.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    if let Some(core) = weak.upgrade() {
                        let mut inner = core.lock();
                        evict_scope(&mut inner, &stale);
                    }
                }));
            }
            Err(_) => evict_scope(inner, &stale),
        }
    }

    fn settle_ok(&self, sn: u64, value: &T) {
        self.settle(sn, |snapshot, newest| {
            snapshot.data = Some(value.clone());
            snapshot.data_expired = false;
            snapshot.error = None;
            if newest {
                snapshot.loading = false;
                snapshot.arguments = None;
                snapshot.argument = None;
            }
        });
    }

    fn settle_err(&self, sn: u64, error: &E) {
        self.settle(sn, |snapshot, newest| {
            snapshot.error = Some(error.clone());
            if newest {
                snapshot.loading = false;
                snapshot.arguments = None;
                snapshot.argument = None;
            }
        });
    }

    /// Routes a settling call to its partition, applies `apply` under the
    /// per-key latest-wins rule, and drops every route entry this
    /// settlement superseded.
    ///
    /// Partitions are created at `Init` only; a call whose partition was
    /// removed while it was in flight settles into nothing. `apply` gets
    /// `true` when the settling call is still the partition's newest.
    fn settle(&self, sn: u64, apply: impl FnOnce(&mut GroupSnapshot<A, T, E>, bool)) {
        let mut inner = self.lock();
        let Some(key) = inner.routes.remove(&sn) else {
            tracing::debug!(sn, "settling call's group route already discarded");
            return;
        };
        let Some(partition) = inner.partitions.get_mut(&key) else {
            tracing::debug!(sn, key, "group route pointed at a missing partition");
            return;
        };
        partition.pending.retain(|&routed| routed != sn);
        if sn < partition.settled_sn {
            tracing::debug!(sn, key, "ignoring stale settlement for group partition");
            return;
        }
        partition.settled_sn = sn;
        let newest = partition.newest_sn;
        partition.tx.send_modify(|snapshot| apply(snapshot, sn >= newest));
        // Calls routed here with a lower sequence number can never pass
        // latest-wins again; their route entries go now, not when (if
        // ever) their futures finish.
        let superseded: Vec<u64> = partition
            .pending
            .iter()
            .copied()
            .filter(|&routed| routed < sn)
            .collect();
        partition.pending.retain(|&routed| routed >= sn);
        for routed in superseded {
            inner.routes.remove(&routed);
        }
    }
}

/// Removes one partition together with the route entries of its still
/// in-flight calls; those calls then settle into nothing.
fn drop_partition<A: CallArgs, T, E>(inner: &mut GroupInner<A, T, E>, key: &str) -> bool {
    match inner.partitions.remove(key) {
        Some(partition) => {
            for sn in partition.pending {
                inner.routes.remove(&sn);
            }
            true
        }
        None => false,
    }
}

fn evict_scope<A: CallArgs, T, E>(inner: &mut GroupInner<A, T, E>, scope: &str) {
    let doomed: Vec<String> = inner
        .partitions
        .iter()
        .filter(|(_, partition)| partition.scope.as_deref() == Some(scope))
        .map(|(key, _)| key.clone())
        .collect();
    let evicted = doomed.len();
    for key in &doomed {
        drop_partition(inner, key);
    }
    if evicted > 0 {
        GroupMetrics::record_evictions(evicted);
        tracing::debug!(scope, evicted, "evicted previous scope's group partitions");
    }
}

/// Handle to a group's partitions, contributed under `{name}Group`.
pub struct GroupState<A: CallArgs, T, E> {
    core: Arc<GroupCore<A, T, E>>,
}

impl<A: CallArgs, T, E> Clone for GroupState<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<A, T, E> GroupState<A, T, E>
where
    A: CallArgs,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Observable view of one partition, if it exists.
    #[must_use]
    pub fn watch(&self, key: &str) -> Option<watch::Receiver<GroupSnapshot<A, T, E>>> {
        let inner = self.core.lock();
        inner.partitions.get(key).map(|partition| partition.tx.subscribe())
    }

    /// Current projection of one partition, if it exists.
    #[must_use]
    pub fn snapshot(&self, key: &str) -> Option<GroupSnapshot<A, T, E>> {
        let inner = self.core.lock();
        inner
            .partitions
            .get(key)
            .map(|partition| partition.tx.borrow().clone())
    }

    /// All live partition keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let inner = self.core.lock();
        let mut keys: Vec<String> = inner.partitions.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Number of live partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.lock().partitions.len()
    }

    /// Whether no partition is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.lock().partitions.is_empty()
    }

    /// Removes one partition (`Some(key)`) or all of them (`None`),
    /// immediately and synchronously.
    ///
    /// Calls still in flight for a removed key settle into nothing; only a
    /// new call recreates the partition.
    pub fn clear(&self, key: Option<&str>) {
        let mut inner = self.core.lock();
        let cleared = match key {
            Some(key) => usize::from(drop_partition(&mut inner, key)),
            None => {
                let all = inner.partitions.len();
                inner.partitions.clear();
                inner.routes.clear();
                all
            }
        };
        if cleared > 0 {
            GroupMetrics::record_cleared(cleared);
            tracing::debug!(key = key.unwrap_or("*"), cleared, "group partitions cleared");
        }
    }
}

impl<A: CallArgs, T, E> fmt::Debug for GroupState<A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.core.lock();
        f.debug_struct("GroupState")
            .field("partitions", &inner.partitions.len())
            .finish_non_exhaustive()
    }
}
