//! Distributed run integration tests
//!
//! Runs Smd0, event-builder nodes and the worker pool end to end over
//! in-memory sources.
//!
//! # Test Coverage
//!
//! - Every worker sees every transition exactly once and in order
//! - Per-worker time ordering with several event-builder nodes
//! - Destination routing
//! - Reduction combined over workers
//! - Monitoring counters
//! - Slow data reaches the handlers of every worker
//! - Handler failures surface as the run error

mod common;

use common::{reader, run_stream, stream};
use parking_lot::Mutex;
use smd_eb::metrics::{EbMetrics, EB_SENT, SMD0_SENT};
use smd_eb::reduction::{ReduceOp, Reduction};
use smd_eb::{run_distributed, DestId, DsParms, EbError, EnvStore, Event, Topology, TransitionId};
use std::sync::Arc;

type Seen = Arc<Mutex<Vec<Vec<(u32, TransitionId)>>>>;

/// Handler factory recording what each worker receives and counting events.
fn recorder(seen: &Seen) -> impl Fn(DestId) -> Box<dyn FnMut(&Event, &EnvStore, &mut Reduction) -> anyhow::Result<()> + Send> {
    let seen = Arc::clone(seen);
    move |id| {
        let seen = Arc::clone(&seen);
        Box::new(move |event: &Event, _: &EnvStore, reduction: &mut Reduction| -> anyhow::Result<()> {
            seen.lock()[id].push((event.timestamp().seconds(), event.service()));
            if !event.is_transition() {
                reduction.accumulate(0, 1.0);
            }
            Ok(())
        })
    }
}

fn transitions(events: &[(u32, TransitionId)]) -> Vec<TransitionId> {
    events
        .iter()
        .map(|&(_, s)| s)
        .filter(|s| s.is_transition())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_robin_over_two_nodes() {
    use TransitionId::*;
    let n_workers = 4;
    let seen: Seen = Arc::new(Mutex::new(vec![Vec::new(); n_workers]));
    let registry = Arc::new(EbMetrics::new().unwrap());
    let parms = DsParms::default()
        .with_batch_size(7)
        .with_workers(n_workers)
        .with_monitor(registry.clone());
    let topology = Topology {
        n_eb_nodes: 2,
        channel_capacity: 1,
    };

    // 512-byte reads split the run into several chunks
    let summary = run_distributed(
        reader(vec![run_stream(100), run_stream(100)], 512),
        parms,
        topology,
        Reduction::new(ReduceOp::Sum, 1),
        recorder(&seen),
    )
    .await
    .unwrap();

    assert_eq!(summary.nevents, 100);
    assert_eq!(summary.synthesized_endruns, 1);
    assert_eq!(summary.reduction.unwrap().values(), &[100.0]);
    assert_eq!(summary.workers.len(), n_workers);
    assert_eq!(summary.nodes.len(), 2);

    let seen = seen.lock();
    let total: usize = seen
        .iter()
        .map(|events| events.iter().filter(|(_, s)| !s.is_transition()).count())
        .sum();
    assert_eq!(total, 100);
    for (worker, events) in seen.iter().enumerate() {
        assert_eq!(
            transitions(events),
            vec![Configure, BeginRun, BeginStep, EndStep, EndRun],
            "worker {worker}"
        );
        assert!(
            events.windows(2).all(|w| w[0].0 <= w[1].0),
            "worker {worker} out of order: {events:?}"
        );
    }

    let delivered: usize = summary.workers.iter().map(|w| w.nevents + w.nsteps).sum();
    assert_eq!(delivered, 100 + 5 * n_workers);
    assert_eq!(registry.total(EB_SENT, "evts") as usize, delivered);
    assert!(registry.total(SMD0_SENT, "batches") >= 5.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_destination_routing() {
    use TransitionId::*;
    let seen: Seen = Arc::new(Mutex::new(vec![Vec::new(); 3]));
    let parms = DsParms::default()
        .with_batch_size(10)
        .with_workers(3)
        .with_destination(|e: &Event| Ok((e.timestamp().seconds() % 3) as DestId));

    let summary = run_distributed(
        reader(vec![run_stream(30)], 256),
        parms,
        Topology::default(),
        Reduction::new(ReduceOp::Sum, 1),
        recorder(&seen),
    )
    .await
    .unwrap();
    assert_eq!(summary.nevents, 30);

    let seen = seen.lock();
    for (worker, events) in seen.iter().enumerate() {
        assert_eq!(transitions(events), vec![Configure, BeginRun, BeginStep, EndStep, EndRun]);
        assert!(events
            .iter()
            .filter(|(_, s)| !s.is_transition())
            .all(|(sec, _)| *sec as usize % 3 == worker));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_reduction() {
    let parms = DsParms::default().with_batch_size(3).with_workers(2);
    let summary = run_distributed(
        reader(vec![run_stream(20)], 1 << 20),
        parms,
        Topology::default(),
        Reduction::new(ReduceOp::Max, 1),
        |_| {
            |event: &Event, _: &EnvStore, reduction: &mut Reduction| -> anyhow::Result<()> {
                reduction.accumulate(0, f64::from(event.timestamp().seconds()));
                Ok(())
            }
        },
    )
    .await
    .unwrap();
    // the EndStep at 24 is the latest real datagram; the EndRun is one
    // microsecond later, still in second 24
    assert_eq!(summary.reduction.unwrap().values(), &[24.0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_update_reaches_every_worker() {
    use TransitionId::*;
    let mut items = vec![(1, Configure), (2, BeginRun), (3, BeginStep)];
    items.extend((4..11).map(|s| (s, L1Accept)));
    items.push((11, SlowUpdate));
    items.extend((12..21).map(|s| (s, L1Accept)));
    items.push((21, EndStep));

    let slow: Arc<Mutex<Vec<(u32, Option<u32>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&slow);
    let summary = run_distributed(
        reader(vec![stream(&items)], 128),
        DsParms::default().with_batch_size(3).with_workers(2),
        Topology::default(),
        Reduction::new(ReduceOp::Sum, 0),
        move |_| {
            let sink = Arc::clone(&sink);
            move |event: &Event, env: &EnvStore, _: &mut Reduction| -> anyhow::Result<()> {
                if !event.is_transition() {
                    let latest = env.checkout(event).first().copied().flatten();
                    sink.lock()
                        .push((event.timestamp().seconds(), latest.map(|d| d.timestamp().seconds())));
                }
                Ok(())
            }
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.nevents, 16);
    assert!(summary.workers.iter().all(|w| w.nslow == 1));
    let slow = slow.lock();
    assert_eq!(slow.len(), 16);
    for &(sec, latest) in slow.iter() {
        let expected = (sec > 11).then_some(11);
        assert_eq!(latest, expected, "event at {sec}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_failure_is_reported() {
    let parms = DsParms::default().with_batch_size(5).with_workers(2);
    let result = run_distributed(
        reader(vec![run_stream(50)], 256),
        parms,
        Topology::default(),
        Reduction::new(ReduceOp::Sum, 0),
        |_| {
            |event: &Event, _: &EnvStore, _: &mut Reduction| -> anyhow::Result<()> {
                if event.timestamp().seconds() == 30 {
                    anyhow::bail!("corrupt event");
                }
                Ok(())
            }
        },
    )
    .await;
    match result {
        Err(EbError::Worker { message, .. }) => assert!(message.contains("corrupt event")),
        other => panic!("expected worker error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_routing_over_two_nodes_rejected() {
    let parms = DsParms::default()
        .with_workers(2)
        .with_destination(|_: &Event| Ok(0));
    let topology = Topology {
        n_eb_nodes: 2,
        channel_capacity: 1,
    };
    let result = run_distributed(
        reader(vec![run_stream(1)], 256),
        parms,
        topology,
        Reduction::new(ReduceOp::Sum, 0),
        |_| |_: &Event, _: &EnvStore, _: &mut Reduction| -> anyhow::Result<()> { Ok(()) },
    )
    .await;
    assert!(matches!(result, Err(EbError::Configuration(_))));
}
