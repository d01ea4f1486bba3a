//! Whole-run drivers.
//!
//! [`run_serial`] reads, builds and handles events on the calling thread.
//! [`run_distributed`] starts Smd0, the event-builder nodes and a worker pool
//! and waits for all of them.
//!
//! Worker `w` is fed by node `w % n_eb_nodes` only, so each worker receives
//! data in global timestamp order from a single builder.

use crate::config::DistributorConfig;
use crate::env_store::EnvStore;
use crate::error::{EbError, EbResult};
use crate::event::Event;
use crate::eventbuilder_manager::EventBuilderManager;
use crate::events::Events;
use crate::node::{EventBuilderNode, NodeStats, Smd0, Smd0Stats};
use crate::parms::DsParms;
use crate::reduction::Reduction;
use crate::run_state::RunTracker;
use crate::smd_reader::{SmdChunk, SmdReader};
use crate::worker::{EventHandler, WorkerHandle, WorkerPool, WorkerReport};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

/// Node layout of a distributed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    /// Number of event-builder nodes.
    pub n_eb_nodes: usize,
    /// Bounded channel depth between tiers.
    pub channel_capacity: usize,
}

impl Default for Topology {
    fn default() -> Self {
        Self::from(&DistributorConfig::default())
    }
}

impl From<&DistributorConfig> for Topology {
    fn from(config: &DistributorConfig) -> Self {
        Self {
            n_eb_nodes: config.n_eb_nodes,
            channel_capacity: config.channel_capacity,
        }
    }
}

impl Topology {
    /// Check the layout fits the run parameters.
    pub fn validate(&self, parms: &DsParms) -> EbResult<()> {
        if self.n_eb_nodes == 0 {
            return Err(EbError::Configuration("n_eb_nodes must be > 0".into()));
        }
        if self.n_eb_nodes > parms.n_workers {
            return Err(EbError::Configuration(format!(
                "{} event-builder nodes for {} workers",
                self.n_eb_nodes, parms.n_workers
            )));
        }
        if parms.destination.is_some() && self.n_eb_nodes != 1 {
            return Err(EbError::Configuration(
                "destination routing needs exactly one event-builder node".into(),
            ));
        }
        Ok(())
    }
}

/// What a run did.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Accepted ordinary events.
    pub nevents: usize,
    /// Transition events built.
    pub nsteps: usize,
    /// Batches handed to workers.
    pub nbatches: usize,
    /// Ordinary events rejected by the filter.
    pub nfiltered: usize,
    /// Chunks read (distributed: sent by Smd0).
    pub nchunks: usize,
    /// BeginRuns seen.
    pub runs: u64,
    /// EndRuns inserted for runs left open.
    pub synthesized_endruns: u64,
    /// Combined worker accumulators.
    pub reduction: Option<Reduction>,
    /// Per-worker reports in worker order.
    pub workers: Vec<WorkerReport>,
    /// Per-node counters.
    pub nodes: Vec<NodeStats>,
}

/// Build and handle every event on the calling thread.
///
/// A destination function is ignored with a warning: everything lands in one
/// batch stream. The handler sees the slow data stored up to each event.
/// Reading stops once `max_events` events have been accepted.
pub fn run_serial<F>(mut reader: SmdReader, parms: &DsParms, mut handler: F) -> EbResult<RunSummary>
where
    F: FnMut(&Event, &EnvStore) -> anyhow::Result<()>,
{
    parms.validate()?;
    let mut parms = parms.clone();
    if parms.destination.take().is_some() {
        warn!("destination function ignored in a serial run");
    }

    let mut tracker = RunTracker::new(reader.n_sources());
    let mut summary = RunSummary::default();
    let mut accepted = 0;
    let poll_delay = reader.params().retry_delay;
    let mut env = EnvStore::new(reader.n_sources());

    let mut handle_chunk = |chunk: SmdChunk, summary: &mut RunSummary, accepted: &mut usize| -> EbResult<bool> {
        let mut manager = EventBuilderManager::new(&chunk, &parms, *accepted)?;
        for out in manager.batches() {
            let out = out?;
            summary.nevents += out.nevents;
            summary.nsteps += out.nsteps;
            summary.nfiltered += out.nfiltered;
            let Some(batch) = out.delivery(0)? else {
                continue;
            };
            summary.nbatches += 1;
            for event in Events::from_batch(&batch.data)? {
                env.observe(&event)?;
                handler(&event, &env).map_err(|e| EbError::Worker {
                    worker: 0,
                    message: e.to_string(),
                })?;
            }
        }
        *accepted = manager.accepted();
        Ok(manager.limit_reached())
    };

    while let Some(chunk) = reader.next_chunk()? {
        if chunk.is_empty() {
            trace!("live sources idle");
            std::thread::sleep(poll_delay);
            continue;
        }
        summary.nchunks += 1;
        let chunk = tracker.process(chunk)?;
        if handle_chunk(chunk, &mut summary, &mut accepted)? {
            info!(accepted, "max_events reached, stopping");
            break;
        }
    }
    if let Some(endrun) = tracker.finish() {
        handle_chunk(endrun, &mut summary, &mut accepted)?;
    }

    summary.runs = tracker.runs();
    summary.synthesized_endruns = tracker.synthesized();
    info!(
        nevents = summary.nevents,
        nsteps = summary.nsteps,
        nfiltered = summary.nfiltered,
        "serial run finished"
    );
    Ok(summary)
}

/// Run Smd0, `topology.n_eb_nodes` event-builder nodes and `parms.n_workers`
/// workers until the sources are exhausted.
///
/// Every worker starts from a copy of `reduction`; the copies are combined
/// into [`RunSummary::reduction`]. Must be called inside a multi-threaded
/// tokio runtime.
pub async fn run_distributed<F, H>(
    reader: SmdReader,
    parms: DsParms,
    topology: Topology,
    reduction: Reduction,
    make_handler: F,
) -> EbResult<RunSummary>
where
    F: Fn(usize) -> H,
    H: EventHandler,
{
    parms.validate()?;
    topology.validate(&parms)?;
    let parms = Arc::new(parms);
    let n_sources = reader.n_sources();

    let mut pool = WorkerPool::spawn(parms.n_workers, topology.channel_capacity, reduction, make_handler);
    let mut owned: Vec<Vec<WorkerHandle>> = (0..topology.n_eb_nodes).map(|_| Vec::new()).collect();
    for handle in pool.take_handles() {
        owned[handle.id() % topology.n_eb_nodes].push(handle);
    }

    let mut points = Vec::with_capacity(topology.n_eb_nodes);
    let mut nodes = Vec::with_capacity(topology.n_eb_nodes);
    for (id, workers) in owned.into_iter().enumerate() {
        let (tx, rx) = mpsc::channel(topology.channel_capacity.max(1));
        let node = EventBuilderNode::new(id, n_sources, Arc::clone(&parms), workers)?;
        points.push(tx);
        nodes.push(tokio::task::spawn_blocking(move || node.run(rx)));
    }
    let smd0 = Smd0::new(reader, Arc::clone(&parms), points)?;
    let smd0 = tokio::task::spawn_blocking(move || smd0.run());

    // a failure downstream shows up upstream as a closed channel, so
    // collect everything and report the root cause
    let mut errors = Vec::new();
    let smd0_stats = collect(smd0.await, &mut errors).unwrap_or_default();
    let mut node_stats = Vec::with_capacity(nodes.len());
    for joined in join_all(nodes).await {
        if let Some(stats) = collect(joined, &mut errors) {
            node_stats.push(stats);
        }
    }
    let reports = match pool.join().await {
        Ok(reports) => reports,
        Err(e) => {
            errors.push(e);
            Vec::new()
        }
    };
    if let Some(err) = root_cause(errors) {
        return Err(err);
    }

    summarize(smd0_stats, node_stats, reports)
}

fn collect<T>(joined: Result<EbResult<T>, tokio::task::JoinError>, errors: &mut Vec<EbError>) -> Option<T> {
    match joined.map_err(EbError::from).and_then(|r| r) {
        Ok(value) => Some(value),
        Err(e) => {
            errors.push(e);
            None
        }
    }
}

/// The most downstream error that is not a consequence of another task
/// going away. Errors are collected upstream first.
fn root_cause(errors: Vec<EbError>) -> Option<EbError> {
    let pos = errors
        .iter()
        .rposition(|e| !matches!(e, EbError::WorkerDisconnected(_)))
        .unwrap_or(0);
    errors.into_iter().nth(pos)
}

fn summarize(smd0: Smd0Stats, nodes: Vec<NodeStats>, workers: Vec<WorkerReport>) -> EbResult<RunSummary> {
    let reduction = Reduction::combine_all(workers.iter().map(|w| w.reduction.clone()))?;
    let summary = RunSummary {
        nevents: nodes.iter().map(|n| n.nevents).sum(),
        nsteps: nodes.iter().map(|n| n.nsteps).sum(),
        nbatches: nodes.iter().map(|n| n.nbatches).sum(),
        nfiltered: nodes.iter().map(|n| n.nfiltered).sum(),
        nchunks: smd0.nchunks,
        runs: smd0.runs,
        synthesized_endruns: smd0.synthesized_endruns,
        reduction,
        workers,
        nodes,
    };
    info!(
        nevents = summary.nevents,
        nbatches = summary.nbatches,
        workers = summary.workers.len(),
        "distributed run finished"
    );
    Ok(summary)
}
