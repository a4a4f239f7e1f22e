//! Done-barrier behavior across a fan-in.
//!
//! Following BDD naming convention: given_<context>_when_<action>_then_<outcome>

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Collector, chain, ends, payloads, worker};
use proptest::prelude::*;
use stagewise_engine::{
    Broker, CorrelationId, InMemoryBroker, InMemoryKvStore, OutboundMessage, Result, Route,
    RunMode, StageSpec, Topology, TopologyConfig, WorkerId, WorkerOptions,
};

fn data(cid: &str, body: &str) -> OutboundMessage {
    OutboundMessage::data(CorrelationId::new(cid), body.as_bytes().to_vec())
}

fn done_from_a(cid: &str, replica: usize) -> OutboundMessage {
    OutboundMessage::done(CorrelationId::new(cid), WorkerId::new("a", replica), 0)
}

fn markers_at_c(broker: &InMemoryBroker) -> usize {
    broker
        .published(&Route::shared("c"))
        .iter()
        .filter(|m| m.is_done())
        .count()
}

#[tokio::test]
async fn given_one_of_two_upstream_markers_when_pulling_then_stream_stays_open() -> Result<()> {
    // GIVEN: b expects markers from both replicas of a
    let topology = chain()?;
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryKvStore::new());
    let b = worker(WorkerId::new("b", 0), &topology, &broker, &store, WorkerOptions::default())?;
    let (mut input, _output) = b.open().await?;

    // WHEN: only a_0 has finished
    broker.publish(&Route::shared("b"), data("s1", "row")).await?;
    broker.publish(&Route::shared("b"), done_from_a("s1", 0)).await?;
    let first = input.next().await?;
    let second = tokio::time::timeout(Duration::from_millis(200), input.next()).await;

    // THEN: the data arrives, no end, nothing forwarded
    assert_eq!(first.and_then(|e| e.payload().map(<[u8]>::to_vec)), Some(b"row".to_vec()));
    assert!(second.is_err(), "input must block until every upstream is done");
    assert_eq!(markers_at_c(&broker), 0);
    assert_eq!(input.state().done_received(&CorrelationId::new("s1")), 1);
    Ok(())
}

#[tokio::test]
async fn given_duplicated_marker_when_both_upstreams_finish_then_exactly_one_forward() -> Result<()> {
    // GIVEN: b's queue holds data and markers, with a_1's marker duplicated
    let topology = chain()?;
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryKvStore::new());
    let b = worker(
        WorkerId::new("b", 0),
        &topology,
        &broker,
        &store,
        WorkerOptions::default().with_run_mode(RunMode::Streams(1)),
    )?;
    let collector = Collector::default();

    broker.declare_stage("b", 1, false).await?;
    for message in [
        data("s1", "x"),
        done_from_a("s1", 1),
        data("s1", "y"),
        done_from_a("s1", 1),
        done_from_a("s1", 0),
    ] {
        broker.publish(&Route::shared("b"), message).await?;
    }

    // WHEN: the worker runs its stage
    let report = b.run(&collector).await?;

    // THEN: one End after both payloads and one marker to c
    let events = collector.snapshot().await;
    assert_eq!(payloads(&events), vec!["x", "y"]);
    assert_eq!(ends(&events), 1);
    assert!(events.last().is_some_and(|e| e.is_end()));
    assert_eq!(markers_at_c(&broker), 1);
    assert_eq!(report.duplicate_markers, 1);
    assert_eq!(report.streams_terminated, 1);
    assert_eq!(report.markers_forwarded, 1);
    Ok(())
}

#[tokio::test]
async fn given_terminated_stream_when_inspecting_store_then_state_is_discarded() -> Result<()> {
    // GIVEN: a completed stream at b
    let topology = chain()?;
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryKvStore::new());
    let b = worker(
        WorkerId::new("b", 0),
        &topology,
        &broker,
        &store,
        WorkerOptions::default().with_run_mode(RunMode::Streams(1)),
    )?;
    broker.declare_stage("b", 1, false).await?;
    for message in [data("s1", "x"), done_from_a("s1", 0), done_from_a("s1", 1)] {
        broker.publish(&Route::shared("b"), message).await?;
    }

    // WHEN: the stream terminates
    b.run(&Collector::default()).await?;

    // THEN: only the done_sent tombstone survives
    let snapshot = store.snapshot("b_0").await;
    assert!(snapshot.keys().all(|k| !k.starts_with("log/")));
    let tombstone = snapshot.get("done_sent").map(|v| String::from_utf8_lossy(v).into_owned());
    assert!(tombstone.as_deref().is_some_and(|v| v.contains("s1")));
    for key in ["done_count", "active_streams"] {
        let value = snapshot.get(key).map(|v| String::from_utf8_lossy(v).into_owned());
        assert!(
            value.as_deref().is_none_or(|v| !v.contains("s1")),
            "{key} still mentions s1: {value:?}"
        );
    }
    assert_eq!(broker.ready_len(&Route::shared("b")), 0);
    assert_eq!(broker.unacked_len(&Route::shared("b")), 0);
    Ok(())
}

#[tokio::test]
async fn given_marker_from_unrelated_stage_when_received_then_it_is_ignored() -> Result<()> {
    // GIVEN: c sends a marker to b, which is not one of b's upstreams
    let topology = chain()?;
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryKvStore::new());
    let b = worker(WorkerId::new("b", 0), &topology, &broker, &store, WorkerOptions::default())?;
    let (mut input, _output) = b.open().await?;

    broker
        .publish(
            &Route::shared("b"),
            OutboundMessage::done(CorrelationId::new("s1"), WorkerId::new("c", 0), 0),
        )
        .await?;
    broker.publish(&Route::shared("b"), done_from_a("s1", 0)).await?;
    broker.publish(&Route::shared("b"), done_from_a("s1", 1)).await?;

    // WHEN: pulling
    let event = input.next().await?;

    // THEN: only the two genuine markers count
    assert!(event.is_some_and(|e| e.is_end()));
    assert_eq!(input.state().done_received(&CorrelationId::new("s1")), 2);
    Ok(())
}

#[tokio::test]
async fn given_terminated_stream_when_upstream_marker_is_redelivered_then_nothing_is_forwarded_again(
) -> Result<()> {
    // GIVEN: a single upstream replica, so one marker completes the fan-in
    let config = TopologyConfig::new()
        .with_stage(StageSpec::new("a", 1).to("b"))
        .with_stage(StageSpec::new("b", 1).to("c"))
        .with_stage(StageSpec::new("c", 1));
    let topology = Arc::new(Topology::from_config(&config)?);
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryKvStore::new());
    let b = worker(WorkerId::new("b", 0), &topology, &broker, &store, WorkerOptions::default())?;
    let (mut input, _output) = b.open().await?;

    broker.publish(&Route::shared("b"), data("s1", "row")).await?;
    broker.publish(&Route::shared("b"), done_from_a("s1", 0)).await?;
    assert!(input.next().await?.is_some_and(|e| e.payload().is_some()));
    assert!(input.next().await?.is_some_and(|e| e.is_end()));

    // WHEN: a_0 re-forwards its marker after a restart, and b keeps pulling
    broker.publish(&Route::shared("b"), done_from_a("s1", 0)).await?;
    let after = tokio::time::timeout(Duration::from_millis(200), input.next()).await;

    // THEN: no second End, one marker at c, the tombstone holds
    assert!(after.is_err(), "a redelivered marker must not end the stream again");
    let report = input.report();
    assert_eq!(markers_at_c(&broker), 1);
    assert_eq!(report.streams_terminated, 1);
    assert_eq!(report.markers_forwarded, 1);
    assert_eq!(report.duplicate_markers, 1);
    assert!(input.state().is_done_sent(&CorrelationId::new("s1")));
    assert_eq!(input.state().done_received(&CorrelationId::new("s1")), 0);
    assert_eq!(broker.ready_len(&Route::shared("b")), 0);
    Ok(())
}

#[tokio::test]
async fn given_shared_queue_with_two_replicas_when_one_pulls_first_then_foreign_markers_are_requeued(
) -> Result<()> {
    // GIVEN: p has two unsharded replicas on one shared queue, fed by two a replicas
    let config = TopologyConfig::new()
        .with_stage(StageSpec::new("a", 2).to("p"))
        .with_stage(StageSpec::new("p", 2).to("c"))
        .with_stage(StageSpec::new("c", 1));
    let topology = Arc::new(Topology::from_config(&config)?);
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryKvStore::new());
    let p0 = worker(WorkerId::new("p", 0), &topology, &broker, &store, WorkerOptions::default())?;
    let p1 = worker(WorkerId::new("p", 1), &topology, &broker, &store, WorkerOptions::default())?;
    let (mut input1, _) = p1.open().await?;
    let (mut input0, _) = p0.open().await?;

    let cid = CorrelationId::new("s1");
    for sender in 0..2 {
        for target in 0..2 {
            broker
                .publish(
                    &Route::shared("p"),
                    OutboundMessage::done(cid.clone(), WorkerId::new("a", sender), target),
                )
                .await?;
        }
    }

    // WHEN: p_1 drains the queue before p_0 pulls at all
    let end1 = input1.next().await?;
    let senders1 = input1.state().done_senders(&cid).cloned().unwrap_or_default();
    let end0 = input0.next().await?;
    let senders0 = input0.state().done_senders(&cid).cloned().unwrap_or_default();
    let report1 = input1.finish().await?;
    let report0 = input0.finish().await?;

    // THEN: markers for p_0 went back to the queue and each replica recorded both senders once
    assert!(end1.is_some_and(|e| e.is_end()));
    assert!(end0.is_some_and(|e| e.is_end()));
    let expected: Vec<String> = vec!["a_0".to_string(), "a_1".to_string()];
    assert_eq!(senders1.into_iter().collect::<Vec<_>>(), expected);
    assert_eq!(senders0.into_iter().collect::<Vec<_>>(), expected);
    assert_eq!(report1.misrouted_markers, 2);
    assert_eq!(report0.misrouted_markers, 0);
    assert_eq!(report0.duplicate_markers + report1.duplicate_markers, 0);
    assert_eq!(broker.ready_len(&Route::shared("p")), 0);
    assert_eq!(broker.unacked_len(&Route::shared("p")), 0);
    assert_eq!(markers_at_c(&broker), 2);
    Ok(())
}

fn run_fan_in(senders: &[usize]) -> Result<(usize, usize)> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let config = TopologyConfig::new()
            .with_stage(StageSpec::new("a", 3).to("b"))
            .with_stage(StageSpec::new("b", 1).to("c"))
            .with_stage(StageSpec::new("c", 1));
        let topology = Arc::new(Topology::from_config(&config)?);
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemoryKvStore::new());
        let b = worker(
            WorkerId::new("b", 0),
            &topology,
            &broker,
            &store,
            WorkerOptions::default().with_run_mode(RunMode::Streams(1)),
        )?;
        broker.declare_stage("b", 1, false).await?;
        for sender in senders {
            broker.publish(&Route::shared("b"), done_from_a("s1", *sender)).await?;
        }

        let collector = Collector::default();
        b.run(&collector).await?;
        Ok((ends(&collector.snapshot().await), markers_at_c(&broker)))
    })
}

proptest! {
    /// Whatever the order and duplication of upstream markers, the stream
    /// ends once and forwards once.
    #[test]
    fn prop_fan_in_forwards_exactly_once(
        order in Just(vec![0usize, 1, 2]).prop_shuffle(),
        extra in prop::collection::vec(0usize..3, 0..6),
        seed in any::<u64>(),
    ) {
        let mut senders = order;
        for (i, sender) in extra.into_iter().enumerate() {
            let slots = u64::try_from(senders.len()).unwrap_or(u64::MAX).saturating_add(1);
            let at = seed
                .rotate_left(u32::try_from(i).unwrap_or(0))
                .checked_rem(slots)
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(0);
            senders.insert(at, sender);
        }

        let outcome = run_fan_in(&senders);
        prop_assert!(outcome.is_ok(), "run failed: {:?}", outcome.err());
        if let Ok((ends, forwarded)) = outcome {
            prop_assert_eq!(ends, 1);
            prop_assert_eq!(forwarded, 1);
        }
    }
}
