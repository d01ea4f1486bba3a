//! Distribution nodes.
//!
//! ```text
//!             +------+   chunk i % n_eb_nodes   +-----------+   batches   +----------+
//! sources --> | Smd0 | -----------------------> | EB node k | ----------> | worker w |
//!             +------+                          +-----------+             +----------+
//! ```
//!
//! [`Smd0`] reads chunks, repairs run boundaries and hands chunks out to the
//! event-builder nodes round-robin. Every [`EventBuilderNode`] builds batches
//! from its chunks and feeds the workers it owns. Both tiers keep a
//! [`StepHistory`] so that each receiver sees every transition exactly once
//! and in order, even when the chunk or batch holding it went elsewhere.
//!
//! Nodes run on blocking threads and talk over bounded tokio channels.

use crate::error::{EbError, EbResult};
use crate::event::DestId;
use crate::eventbuilder::{count_events, Batch, BuildOutput};
use crate::eventbuilder_manager::EventBuilderManager;
use crate::metrics::{record_sent, EB_FILTER, EB_SENT, SMD0_SENT};
use crate::parms::DsParms;
use crate::run_state::RunTracker;
use crate::smd_reader::{SmdChunk, SmdReader};
use crate::step_history::StepHistory;
use crate::worker::WorkerHandle;
use anyhow::anyhow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace};

/// Counters of the chunk distributor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Smd0Stats {
    /// Chunks sent, step-only chunks included.
    pub nchunks: usize,
    /// Step-only chunks sent by the final sweep.
    pub step_chunks: usize,
    /// Bytes sent.
    pub nbytes: usize,
    /// BeginRuns seen.
    pub runs: u64,
    /// EndRuns inserted.
    pub synthesized_endruns: u64,
}

/// Reads chunks and distributes them to the event-builder nodes.
pub struct Smd0 {
    reader: SmdReader,
    tracker: RunTracker,
    history: StepHistory,
    points: Vec<mpsc::Sender<SmdChunk>>,
    parms: Arc<DsParms>,
    poll_delay: Duration,
    next: usize,
    stats: Smd0Stats,
}

impl Smd0 {
    /// Distributor over `reader` feeding one channel per event-builder node.
    pub fn new(reader: SmdReader, parms: Arc<DsParms>, points: Vec<mpsc::Sender<SmdChunk>>) -> EbResult<Self> {
        if points.is_empty() {
            return Err(EbError::Configuration(
                "Smd0 needs at least one event-builder node".into(),
            ));
        }
        let n_sources = reader.n_sources();
        let poll_delay = reader.params().retry_delay;
        Ok(Self {
            reader,
            tracker: RunTracker::new(n_sources),
            history: StepHistory::new(n_sources),
            points,
            parms,
            poll_delay,
            next: 0,
            stats: Smd0Stats::default(),
        })
    }

    /// Read until every source is exhausted, then close the node channels.
    #[instrument(skip(self), fields(n_points = self.points.len()))]
    pub fn run(mut self) -> EbResult<Smd0Stats> {
        while let Some(chunk) = self.reader.next_chunk()? {
            if chunk.is_empty() {
                trace!("live sources idle");
                std::thread::sleep(self.poll_delay);
                continue;
            }
            let chunk = self.tracker.process(chunk)?;
            self.send_chunk(chunk)?;
        }
        if let Some(endrun) = self.tracker.finish() {
            self.send_chunk(endrun)?;
        }

        // nodes that missed the last transitions still need them
        for point in 0..self.points.len() {
            if self.history.pending(point) == 0 {
                continue;
            }
            let steps = SmdChunk::new(self.history.get_buffer(point));
            self.send_to(point, steps, Instant::now())?;
            self.stats.step_chunks += 1;
        }

        self.stats.runs = self.tracker.runs();
        self.stats.synthesized_endruns = self.tracker.synthesized();
        info!(
            nchunks = self.stats.nchunks,
            bytes_read = self.reader.bytes_read(),
            runs = self.stats.runs,
            "smd0 finished"
        );
        Ok(self.stats)
    }

    fn send_chunk(&mut self, chunk: SmdChunk) -> EbResult<()> {
        let started = Instant::now();
        let point = self.next % self.points.len();
        self.next += 1;

        let missing = self.history.get_buffer(point);
        let steps = chunk.step_views()?;
        let patched = chunk.prepend(&missing)?;
        if steps.iter().any(|v| !v.is_empty()) {
            self.history.extend_buffers(&steps, point, false)?;
        }
        self.send_to(point, patched, started)
    }

    fn send_to(&mut self, point: usize, chunk: SmdChunk, started: Instant) -> EbResult<()> {
        let nevents = count_events(&chunk.views)?;
        let nbytes = chunk.total_bytes();
        self.points[point]
            .blocking_send(chunk)
            .map_err(|_| EbError::WorkerDisconnected(point))?;
        record_sent(self.parms.monitor.as_ref(), SMD0_SENT, point, nevents, nbytes, started.elapsed());
        self.stats.nchunks += 1;
        self.stats.nbytes += nbytes;
        trace!(point, nevents, nbytes, "chunk sent");
        Ok(())
    }
}

/// Counters of one event-builder node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Node id.
    pub node: usize,
    /// Chunks received.
    pub nchunks: usize,
    /// Accepted ordinary events.
    pub nevents: usize,
    /// Transition events built.
    pub nsteps: usize,
    /// Ordinary events rejected by the filter.
    pub nfiltered: usize,
    /// Batches sent, step-only batches included.
    pub nbatches: usize,
    /// Step-only batches sent.
    pub step_batches: usize,
}

/// Builds batches from chunks and feeds the workers it owns.
///
/// With a destination function the node must own every worker and each
/// batch goes to the worker it names. Otherwise batches go round-robin over
/// the owned workers and the others receive the new transitions as step-only
/// batches.
pub struct EventBuilderNode {
    parms: Arc<DsParms>,
    workers: Vec<WorkerHandle>,
    history: StepHistory,
    accepted: usize,
    next: usize,
    stats: NodeStats,
}

impl EventBuilderNode {
    /// Node `id` over `n_sources` sources owning `workers`.
    pub fn new(id: usize, n_sources: usize, parms: Arc<DsParms>, workers: Vec<WorkerHandle>) -> EbResult<Self> {
        if workers.is_empty() {
            return Err(EbError::Configuration(format!(
                "event-builder node {id} owns no workers"
            )));
        }
        if parms.destination.is_some() {
            let owned: Vec<DestId> = workers.iter().map(WorkerHandle::id).collect();
            if owned != parms.known_destinations() {
                return Err(EbError::Configuration(format!(
                    "destination routing needs node {id} to own workers 0..{}",
                    parms.n_workers
                )));
            }
        }
        Ok(Self {
            parms,
            workers,
            history: StepHistory::new(n_sources),
            accepted: 0,
            next: 0,
            stats: NodeStats {
                node: id,
                ..NodeStats::default()
            },
        })
    }

    /// Node id.
    #[must_use]
    pub fn id(&self) -> usize {
        self.stats.node
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Consume chunks until the channel closes.
    #[instrument(skip_all, fields(node = self.stats.node))]
    pub fn run(mut self, mut chunks: mpsc::Receiver<SmdChunk>) -> EbResult<NodeStats> {
        while let Some(chunk) = chunks.blocking_recv() {
            self.process_chunk(&chunk)?;
        }
        self.finish()
    }

    /// Build and dispatch every batch of `chunk`.
    pub fn process_chunk(&mut self, chunk: &SmdChunk) -> EbResult<()> {
        self.stats.nchunks += 1;
        let parms = Arc::clone(&self.parms);
        let mut manager = EventBuilderManager::new(chunk, &parms, self.accepted)?;
        for out in manager.batches() {
            let out = out?;
            self.stats.nevents += out.nevents;
            self.stats.nsteps += out.nsteps;
            if out.nfiltered > 0 {
                self.stats.nfiltered += out.nfiltered;
                parms.monitor.increment(
                    EB_FILTER,
                    &["evts", &self.stats.node.to_string()],
                    out.nfiltered as f64,
                );
            }
            if parms.destination.is_some() {
                self.route(out)?;
            } else {
                self.round_robin(out)?;
            }
        }
        self.accepted = manager.accepted();
        Ok(())
    }

    /// Send pending transitions to every worker and stop.
    pub fn finish(mut self) -> EbResult<NodeStats> {
        self.sweep()?;
        debug!(
            node = self.stats.node,
            nevents = self.stats.nevents,
            nbatches = self.stats.nbatches,
            "event-builder node finished"
        );
        Ok(self.stats)
    }

    fn route(&mut self, out: BuildOutput) -> EbResult<()> {
        let steps = out.step_views()?;
        let mut delivered = Vec::new();
        for dest in self.parms.known_destinations() {
            let Some(batch) = out.delivery(dest)? else {
                continue;
            };
            let idx = self.index_of(dest)?;
            let missing = self.history.get_buffer(dest);
            self.send(idx, batch.prepend(&missing)?)?;
            delivered.push(dest);
        }
        // every destination sent to got the transitions merged in
        if let (Some(steps), Some((first, rest))) = (steps, delivered.split_first()) {
            self.history.extend_buffers(&steps, *first, false)?;
            for &dest in rest {
                self.history.mark_delivered(dest);
            }
        }
        Ok(())
    }

    fn round_robin(&mut self, out: BuildOutput) -> EbResult<()> {
        let steps = out.step_views()?;
        let Some(batch) = out.delivery(0)? else {
            return Ok(());
        };
        let idx = self.next % self.workers.len();
        self.next += 1;
        let worker = self.workers[idx].id();

        let missing = self.history.get_buffer(worker);
        self.send(idx, batch.prepend(&missing)?)?;
        if let Some(steps) = steps {
            self.history.extend_buffers(&steps, worker, false)?;
            self.sweep()?;
        }
        Ok(())
    }

    /// Step-only batches for every owned worker with pending transitions.
    fn sweep(&mut self) -> EbResult<()> {
        for idx in 0..self.workers.len() {
            let worker = self.workers[idx].id();
            if self.history.pending(worker) == 0 {
                continue;
            }
            let batch = Batch::steps_only(&self.history.get_buffer(worker))?;
            self.send(idx, batch)?;
            self.stats.step_batches += 1;
        }
        Ok(())
    }

    fn index_of(&self, dest: DestId) -> EbResult<usize> {
        self.workers
            .iter()
            .position(|w| w.id() == dest)
            .ok_or_else(|| {
                EbError::Destination(anyhow!(
                    "destination {dest} is not served by node {}",
                    self.stats.node
                ))
            })
    }

    fn send(&mut self, idx: usize, batch: Batch) -> EbResult<()> {
        let started = Instant::now();
        let (nevents, nbytes) = (batch.nevents + batch.nsteps, batch.size());
        let worker = self.workers[idx].id();
        self.workers[idx].dispatch_blocking(batch)?;
        record_sent(self.parms.monitor.as_ref(), EB_SENT, worker, nevents, nbytes, started.elapsed());
        self.stats.nbatches += 1;
        Ok(())
    }
}
