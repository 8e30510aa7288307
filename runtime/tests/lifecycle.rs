//! Integration tests for call tracking across overlapping invocations
//!
//! Exercises the full pipeline surface: invocation records, latest-wins
//! settlement, the reserved observable cells and ordered lifecycle events,
//! with settlement order controlled from the test.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use calltrack_runtime::{CallEventKind, Pipeline, Tracked};
use calltrack_testing::{ControlledTarget, Recorder};
use futures::FutureExt;
use tokio_test::{assert_pending, assert_ready, task};

// ============================================================================
// Test Fixtures
// ============================================================================

type Args = (u32,);
type Target = ControlledTarget<Args, u32, String>;

fn controlled_pipeline(name: &str) -> (Target, Tracked<Args, u32, String>) {
    let target = Target::new();
    let tracked = Pipeline::new(name, target.target_fn())
        .build()
        .expect("pipeline with no addons builds");
    (target, tracked)
}

// ============================================================================
// Latest-wins settlement
// ============================================================================

#[tokio::test]
async fn fast_follow_up_call_owns_the_cells() {
    let (target, tracked) = controlled_pipeline("query");

    let slow = tracked.call((1,));
    let fast = tracked.call((2,));
    assert!(*tracked.loading().borrow());
    assert_eq!(*tracked.arguments().borrow(), Some((2,)));

    // The newer call settles first and releases the cells.
    assert!(target.fulfill(1, 20));
    assert_eq!(fast.await, Ok(20));
    assert!(!*tracked.loading().borrow());
    assert!(tracked.arguments().borrow().is_none());

    // The superseded call still settles for its own awaiter, but the
    // cells no longer move.
    assert!(target.fulfill(0, 10));
    assert_eq!(slow.await, Ok(10));
    assert!(!*tracked.loading().borrow());
    assert!(tracked.error().borrow().is_none());
}

#[tokio::test]
async fn stale_rejection_never_reaches_the_error_cell() {
    let (target, tracked) = controlled_pipeline("query");

    let slow = tracked.call((1,));
    let fast = tracked.call((2,));

    assert!(target.fulfill(1, 20));
    assert_eq!(fast.await, Ok(20));

    // The older call fails after a newer call already finished; the
    // failure is the awaiter's alone.
    assert!(target.reject(0, "timeout".to_string()));
    assert_eq!(slow.await, Err("timeout".to_string()));
    assert!(tracked.error().borrow().is_none());
}

#[tokio::test]
async fn error_cell_follows_the_latest_settled_call() {
    let (target, tracked) = controlled_pipeline("query");

    let failing = tracked.call((1,));
    assert!(target.reject(0, "boom".to_string()));
    assert_eq!(failing.await, Err("boom".to_string()));
    assert_eq!(*tracked.error().borrow(), Some("boom".to_string()));

    let recovering = tracked.call((2,));
    assert!(target.fulfill(1, 20));
    assert_eq!(recovering.await, Ok(20));
    assert!(tracked.error().borrow().is_none());
}

#[tokio::test]
async fn arguments_cell_tracks_the_newest_inflight_call() {
    let (target, tracked) = controlled_pipeline("query");

    let first = tracked.call((1,));
    assert_eq!(*tracked.arguments().borrow(), Some((1,)));
    assert_eq!(*tracked.argument().borrow(), Some(1));

    let second = tracked.call((2,));
    assert_eq!(*tracked.arguments().borrow(), Some((2,)));
    assert_eq!(*tracked.argument().borrow(), Some(2));

    assert!(target.fulfill(1, 20));
    assert_eq!(second.await, Ok(20));
    assert!(tracked.arguments().borrow().is_none());
    assert!(tracked.argument().borrow().is_none());

    // The older call settling afterwards cannot repopulate the cells.
    assert!(target.fulfill(0, 10));
    assert_eq!(first.await, Ok(10));
    assert!(tracked.arguments().borrow().is_none());
}

#[tokio::test]
async fn abandoned_call_keeps_its_pending_state() {
    let (target, tracked) = controlled_pipeline("query");

    let abandoned = tracked.call((1,));
    drop(abandoned);
    // Dropping the future abandons the work; nothing ever settles it.
    assert!(*tracked.loading().borrow());

    let live = tracked.call((2,));
    assert!(target.fulfill(1, 20));
    assert_eq!(live.await, Ok(20));
    assert!(!*tracked.loading().borrow());
}

#[test]
fn call_future_stays_pending_until_its_target_settles() {
    let (target, tracked) = controlled_pipeline("query");

    let mut call = task::spawn(tracked.call((1,)));
    assert_pending!(call.poll());
    assert!(*tracked.loading().borrow());

    assert!(target.fulfill(0, 10));
    assert!(call.is_woken());
    assert_eq!(assert_ready!(call.poll()), Ok(10));
    assert!(!*tracked.loading().borrow());
}

// ============================================================================
// Event ordering
// ============================================================================

#[tokio::test]
async fn each_call_sees_a_strictly_ordered_lifecycle() {
    let target = Target::new();
    let recorder = Recorder::new();
    let tracked = Pipeline::new("query", target.target_fn())
        .addon(recorder.clone())
        .build()
        .expect("pipeline builds");

    let slow = tracked.call((1,));
    let fast = tracked.call((2,));
    assert!(target.fulfill(1, 20));
    assert!(target.fulfill(0, 10));
    assert_eq!(fast.await, Ok(20));
    assert_eq!(slow.await, Ok(10));

    let expected = vec![
        CallEventKind::Init,
        CallEventKind::Before,
        CallEventKind::After,
        CallEventKind::Fulfill,
    ];
    assert_eq!(recorder.lifecycle_for(1), expected);
    assert_eq!(recorder.lifecycle_for(2), expected);

    // Terminal events interleave in completion order, not start order.
    let settlements: Vec<u64> = recorder
        .events()
        .into_iter()
        .filter(|(kind, _)| *kind == CallEventKind::Fulfill)
        .map(|(_, sn)| sn)
        .collect();
    assert_eq!(settlements, vec![2, 1]);
}

// ============================================================================
// Properties
// ============================================================================

proptest::proptest! {
    /// However overlapping calls interleave their settlements, the cells
    /// end up describing the most recently created call.
    #[test]
    fn cells_converge_on_the_newest_call(order in order_strategy()) {
        let (target, tracked) = controlled_pipeline("query");

        let calls = order.len();
        let mut futures: Vec<_> = (0..calls)
            .map(|n| Some(tracked.call((u32::try_from(n).unwrap(),))))
            .collect();

        for settled in order {
            assert!(target.fulfill(settled, 1));
            let future = futures[settled].take().unwrap();
            assert_eq!(future.now_or_never(), Some(Ok(1)));
        }

        proptest::prop_assert!(!*tracked.loading().borrow());
        proptest::prop_assert!(tracked.arguments().borrow().is_none());
        proptest::prop_assert!(tracked.error().borrow().is_none());
    }
}

fn order_strategy() -> impl proptest::strategy::Strategy<Value = Vec<usize>> {
    use proptest::strategy::{Just, Strategy};

    (1_usize..6).prop_flat_map(|calls| Just((0..calls).collect::<Vec<_>>()).prop_shuffle())
}

#[tokio::test]
async fn rejection_is_forwarded_after_observers_ran() {
    let target = Target::new();
    let recorder = Recorder::new();
    let tracked = Pipeline::new("query", target.target_fn())
        .addon(recorder.clone())
        .build()
        .expect("pipeline builds");

    let call = tracked.call((1,));
    assert!(target.reject(0, "boom".to_string()));
    assert_eq!(call.await, Err("boom".to_string()));

    assert_eq!(
        recorder.lifecycle_for(1),
        vec![
            CallEventKind::Init,
            CallEventKind::Before,
            CallEventKind::After,
            CallEventKind::Reject,
        ]
    );
}
