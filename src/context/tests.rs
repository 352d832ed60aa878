use super::*;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, PartialEq)]
struct ValueA(u64);
#[derive(Debug, PartialEq)]
struct ValueB(u64);

#[test]
fn context_immutable() {
    // start with current, which should be an empty context
    let cx = Context::current();
    assert_eq!(cx.get::<ValueA>(), None);
    assert_eq!(cx.get::<ValueB>(), None);

    // with_value returns a new context, leaving the original unchanged
    let cx_new = cx.with_value(ValueA(1));
    assert_eq!(cx.get::<ValueA>(), None);
    assert_eq!(cx_new.get::<ValueA>(), Some(&ValueA(1)));

    let cx_newer = cx_new.with_value(ValueB(1));

    // cx and cx_new are unchanged
    assert_eq!(cx.get::<ValueA>(), None);
    assert_eq!(cx.get::<ValueB>(), None);
    assert_eq!(cx_new.get::<ValueA>(), Some(&ValueA(1)));
    assert_eq!(cx_new.get::<ValueB>(), None);

    // cx_newer contains both values
    assert_eq!(cx_newer.get::<ValueA>(), Some(&ValueA(1)));
    assert_eq!(cx_newer.get::<ValueB>(), Some(&ValueB(1)));
}

#[test]
fn nested_contexts() {
    let _outer_guard = Context::new().with_value(ValueA(1)).attach();

    // Only value `a` is set
    let current = Context::current();
    assert_eq!(current.get(), Some(&ValueA(1)));
    assert_eq!(current.get::<ValueB>(), None);

    {
        let _inner_guard = Context::current_with_value(ValueB(42)).attach();
        // Both values are set in inner context
        let current = Context::current();
        assert_eq!(current.get(), Some(&ValueA(1)));
        assert_eq!(current.get(), Some(&ValueB(42)));
    }

    // Resets to only value `a` when inner guard is dropped; the attach/drop
    // round trip restores the exact previous current.
    let current = Context::current();
    assert_eq!(current.get(), Some(&ValueA(1)));
    assert_eq!(current.get::<ValueB>(), None);
}

#[test]
fn overlapping_contexts() {
    let outer_guard = Context::new().with_value(ValueA(1)).attach();

    let inner_guard = Context::current_with_value(ValueB(42)).attach();
    let current = Context::current();
    assert_eq!(current.get(), Some(&ValueA(1)));
    assert_eq!(current.get(), Some(&ValueB(42)));

    // Out of order drop: inner_guard is still alive, so both values must
    // remain accessible. The last correct release wins.
    drop(outer_guard);

    let current = Context::current();
    assert_eq!(current.get(), Some(&ValueA(1)));
    assert_eq!(current.get(), Some(&ValueB(42)));

    drop(inner_guard);

    // Both guards are dropped and neither value should be accessible.
    let current = Context::current();
    assert_eq!(current.get::<ValueA>(), None);
    assert_eq!(current.get::<ValueB>(), None);
}

#[test]
fn too_many_contexts() {
    let mut guards: Vec<ContextGuard> = Vec::with_capacity(ContextStack::MAX_POS as usize);
    let stack_max_pos = ContextStack::MAX_POS as u64;
    // Fill the stack up until the last position
    for i in 1..stack_max_pos {
        let cx_guard = Context::current().with_value(ValueB(i)).attach();
        assert_eq!(Context::current().get(), Some(&ValueB(i)));
        assert_eq!(cx_guard.cx_pos, i as u16);
        guards.push(cx_guard);
    }
    // Overflow the stack a couple of times; attaches become no-ops
    for _ in 0..16 {
        let cx_guard = Context::current().with_value(ValueA(1)).attach();
        assert_eq!(cx_guard.cx_pos, ContextStack::MAX_POS);
        assert_eq!(Context::current().get::<ValueA>(), None);
        assert_eq!(Context::current().get(), Some(&ValueB(stack_max_pos - 1)));
        guards.push(cx_guard);
    }
    // Dropping the overflow guards must not disturb the current context
    for _ in 0..16 {
        guards.pop();
        assert_eq!(Context::current().get::<ValueA>(), None);
        assert_eq!(Context::current().get(), Some(&ValueB(stack_max_pos - 1)));
    }
    // Drop one more so a new attach fits again
    guards.pop();
    let cx_guard = Context::current().with_value(ValueA(2)).attach();
    assert_eq!(cx_guard.cx_pos, ContextStack::MAX_POS - 1);
    assert_eq!(Context::current().get(), Some(&ValueA(2)));
    guards.push(cx_guard);
}

#[test]
fn pop_id_out_of_order() {
    let mut stack = ContextStack::default();

    let id1 = stack.push(Context::new().with_value(ValueA(1)));
    let id2 = stack.push(Context::new().with_value(ValueA(2)));
    let id3 = stack.push(Context::new().with_value(ValueA(3)));

    // Pop middle context first, which should not affect the current context
    stack.pop_id(id2);
    assert_eq!(stack.current_cx.get::<ValueA>(), Some(&ValueA(3)));
    assert_eq!(stack.stack.len(), 3);

    // Pop last context, which should restore the previous valid context
    stack.pop_id(id3);
    assert_eq!(stack.current_cx.get::<ValueA>(), Some(&ValueA(1)));
    assert_eq!(stack.stack.len(), 1);

    // Pop first context, which should restore the empty state
    stack.pop_id(id1);
    assert_eq!(stack.current_cx.get::<ValueA>(), None);
    assert_eq!(stack.stack.len(), 0);
}

/// Edge cases in context stack operations. IRL these should log warnings,
/// and definitely not panic.
#[test]
fn pop_id_edge_cases() {
    let mut stack = ContextStack::default();

    stack.pop_id(ContextStack::BASE_POS);
    assert_eq!(stack.stack.len(), 0);

    stack.pop_id(ContextStack::MAX_POS);
    assert_eq!(stack.stack.len(), 0);

    stack.pop_id(1000);
    assert_eq!(stack.stack.len(), 0);

    stack.pop_id(1);
    assert_eq!(stack.stack.len(), 0);
}

/// Parent context values are propagated into async operations, and values
/// added during async operations do not leak back into the parent.
#[tokio::test]
async fn async_context_propagation() {
    async fn nested_operation() {
        assert_eq!(
            Context::current().get::<ValueA>(),
            Some(&ValueA(42)),
            "parent context value should be available in async operation"
        );

        let cx_with_both = Context::current()
            .with_value(ValueA(43))
            .with_value(ValueB(24));

        async {
            assert_eq!(Context::current().get::<ValueA>(), Some(&ValueA(43)));
            assert_eq!(Context::current().get::<ValueB>(), Some(&ValueB(24)));

            sleep(Duration::from_millis(10)).await;

            // Values should still be available after the await point, which
            // may have resumed on another worker thread.
            assert_eq!(Context::current().get::<ValueA>(), Some(&ValueA(43)));
            assert_eq!(Context::current().get::<ValueB>(), Some(&ValueB(24)));
        }
        .with_context(cx_with_both)
        .await;
    }

    let parent_cx = Context::new().with_value(ValueA(42));

    nested_operation().with_context(parent_cx.clone()).await;

    // Parent context is unchanged, and the current context is back to default
    assert_eq!(parent_cx.get::<ValueA>(), Some(&ValueA(42)));
    assert_eq!(parent_cx.get::<ValueB>(), None);
    assert_eq!(Context::current().get::<ValueA>(), None);
    assert_eq!(Context::current().get::<ValueB>(), None);
}

/// Unnatural parent->child relationships in nested async operations behave
/// properly: a future can outlive the future that created it.
#[tokio::test]
async fn out_of_order_context_detachment_futures() {
    // Returns a future without awaiting it, so the creator completes first.
    async fn create_a_future() -> impl std::future::Future<Output = ()> {
        async {
            assert_eq!(Context::current().get::<ValueA>(), Some(&ValueA(42)));

            sleep(Duration::from_millis(50)).await;
        }
        .with_context(Context::current())
    }

    let parent_cx = Context::new().with_value(ValueA(42));

    let future = create_a_future().with_context(parent_cx).await;

    // The future that created this one is long gone.
    future.await;

    // Nothing from the nested operations may stick to the current context.
    assert_eq!(Context::current().get::<ValueA>(), None);
    assert_eq!(Context::current().get::<ValueB>(), None);
}

#[test]
fn telemetry_suppression_is_scoped() {
    let _reset_guard = Context::new().attach();

    assert!(!Context::is_current_telemetry_suppressed());

    let cx = Context::new();
    let suppressed = cx.with_telemetry_suppressed();
    // deriving does not mutate the original
    assert!(!cx.is_telemetry_suppressed());
    assert!(suppressed.is_telemetry_suppressed());

    {
        let _guard = Context::enter_telemetry_suppressed_scope();
        assert!(Context::is_current_telemetry_suppressed());

        // contexts derived from current inherit suppression
        {
            let _inner = Context::current().with_value(ValueA(1)).attach();
            assert!(Context::is_current_telemetry_suppressed());
        }

        // fresh contexts do not
        {
            let _inner = Context::new().with_value(ValueA(1)).attach();
            assert!(!Context::is_current_telemetry_suppressed());
        }

        assert!(Context::is_current_telemetry_suppressed());
    }

    assert!(!Context::is_current_telemetry_suppressed());
}
