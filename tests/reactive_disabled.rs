//! Degraded-mode behavior: the operator is never installed in this binary,
//! so the propagation hooks must pass straight through.

use std::sync::Arc;
use futures_util::StreamExt;
use tracelift::extractor::ConstantName;
use tracelift::reactive::{ContextPropagationOperator, PropagatedStreamExt};
use tracelift::testing::InMemorySink;
use tracelift::{Context, Instrumenter};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uninstalled_hook_leaves_operations_unparented() {
    assert!(!ContextPropagationOperator::is_installed());

    let sink = Arc::new(InMemorySink::new());
    let outer: Instrumenter<(), ()> =
        Instrumenter::builder(sink.clone(), "degraded-test", ConstantName("outer")).build();
    let inner: Instrumenter<(), ()> =
        Instrumenter::builder(sink.clone(), "degraded-test", ConstantName("inner")).build();

    let outer_cx = outer.start(&Context::current(), &());
    let stream = {
        let _guard = outer_cx.clone().attach();
        futures_util::stream::iter(vec![1, 2])
            .map(move |item| {
                let cx = inner.start(&Context::current(), &());
                inner.end(&cx, &(), None, None);
                item
            })
            .propagate_context()
    };

    // nothing was captured, so the events see no restored context
    let collected = tokio::spawn(stream.collect::<Vec<i32>>()).await.unwrap();
    assert_eq!(collected, vec![1, 2]);
    outer.end(&outer_cx, &(), None, None);

    let records = sink.finished_records();
    assert_eq!(records.len(), 3);
    for record in records.iter().filter(|r| r.name == "inner") {
        assert_eq!(record.parent_id, None);
    }
}

#[tokio::test]
async fn degraded_hook_is_behaviorally_transparent() {
    assert!(!ContextPropagationOperator::is_installed());

    #[derive(Debug, PartialEq)]
    struct Marker;

    let cx = Context::new().with_value(Marker);
    let stream = {
        let _guard = cx.attach();
        futures_util::stream::iter(vec![10, 20])
            .map(|item| {
                assert_eq!(Context::current().get::<Marker>(), None);
                item * 2
            })
            .propagate_context()
    };

    let collected: Vec<i32> = stream.collect().await;
    assert_eq!(collected, vec![20, 40]);
}
