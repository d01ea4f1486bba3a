//! Worker pool.
//!
//! Each worker owns a dedicated bounded channel, so a slow worker only
//! applies backpressure to the distributor feeding it. A dispatch carries a
//! one-shot acknowledgement; the sender waits for it before sending the next
//! batch to the same worker, which keeps at most one batch in flight per
//! destination.

use crate::env_store::EnvStore;
use crate::error::{EbError, EbResult};
use crate::event::{DestId, Event};
use crate::eventbuilder::Batch;
use crate::events::Events;
use crate::reduction::Reduction;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Processes the events of the batches a worker receives.
pub trait EventHandler: Send + 'static {
    /// Handle one event, transitions included.
    ///
    /// `env` already holds the slow data of every SlowUpdate up to and
    /// including this event.
    fn handle(&mut self, event: &Event, env: &EnvStore, reduction: &mut Reduction) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: FnMut(&Event, &EnvStore, &mut Reduction) -> anyhow::Result<()> + Send + 'static,
{
    fn handle(&mut self, event: &Event, env: &EnvStore, reduction: &mut Reduction) -> anyhow::Result<()> {
        self(event, env, reduction)
    }
}

struct Dispatch {
    batch: Batch,
    ack: oneshot::Sender<()>,
}

/// What one worker did over the run.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    /// Worker id.
    pub worker: DestId,
    /// Ordinary events handled.
    pub nevents: usize,
    /// Transition events handled.
    pub nsteps: usize,
    /// Batches received.
    pub nbatches: usize,
    /// Slow-data datagrams stored.
    pub nslow: usize,
    /// Final accumulator.
    pub reduction: Reduction,
}

/// Sending side of one worker.
pub struct WorkerHandle {
    id: DestId,
    tx: mpsc::Sender<Dispatch>,
    inflight: Option<oneshot::Receiver<()>>,
}

impl WorkerHandle {
    /// Worker id.
    #[must_use]
    pub fn id(&self) -> DestId {
        self.id
    }

    fn prepare(batch: Batch) -> (Dispatch, oneshot::Receiver<()>) {
        let (ack, done) = oneshot::channel();
        (Dispatch { batch, ack }, done)
    }

    /// Send a batch from a blocking thread.
    ///
    /// Waits until the worker has finished the previous batch.
    pub fn dispatch_blocking(&mut self, batch: Batch) -> EbResult<()> {
        if let Some(prev) = self.inflight.take() {
            prev.blocking_recv()
                .map_err(|_| EbError::WorkerDisconnected(self.id))?;
        }
        let (dispatch, done) = Self::prepare(batch);
        self.tx
            .blocking_send(dispatch)
            .map_err(|_| EbError::WorkerDisconnected(self.id))?;
        self.inflight = Some(done);
        Ok(())
    }

    /// Send a batch from async code.
    pub async fn dispatch(&mut self, batch: Batch) -> EbResult<()> {
        if let Some(prev) = self.inflight.take() {
            prev.await.map_err(|_| EbError::WorkerDisconnected(self.id))?;
        }
        let (dispatch, done) = Self::prepare(batch);
        self.tx
            .send(dispatch)
            .await
            .map_err(|_| EbError::WorkerDisconnected(self.id))?;
        self.inflight = Some(done);
        Ok(())
    }
}

/// A set of workers running on the blocking thread pool.
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
    joins: Vec<JoinHandle<EbResult<WorkerReport>>>,
}

impl WorkerPool {
    /// Start `n_workers` workers.
    ///
    /// `make_handler` is called once per worker id; every worker starts from
    /// a copy of `reduction`. Must be called inside a tokio runtime.
    pub fn spawn<F, H>(n_workers: usize, capacity: usize, reduction: Reduction, make_handler: F) -> Self
    where
        F: Fn(DestId) -> H,
        H: EventHandler,
    {
        let mut handles = Vec::with_capacity(n_workers);
        let mut joins = Vec::with_capacity(n_workers);
        for id in 0..n_workers {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            let handler = make_handler(id);
            let reduction = reduction.clone();
            joins.push(tokio::task::spawn_blocking(move || {
                worker_loop(id, rx, handler, reduction)
            }));
            handles.push(WorkerHandle {
                id,
                tx,
                inflight: None,
            });
        }
        debug!(n_workers, capacity, "worker pool started");
        Self { handles, joins }
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.joins.len()
    }

    /// No workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Take the sending handles; workers stop once every handle is dropped.
    pub fn take_handles(&mut self) -> Vec<WorkerHandle> {
        std::mem::take(&mut self.handles)
    }

    /// Wait for every worker and collect their reports in worker order.
    ///
    /// Handles not taken are dropped first.
    pub async fn join(mut self) -> EbResult<Vec<WorkerReport>> {
        self.handles.clear();
        let mut reports = Vec::with_capacity(self.joins.len());
        let mut first_err = None;
        for (id, join) in self.joins.into_iter().enumerate() {
            match join.await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(EbError::Worker {
                        worker: id,
                        message: e.to_string(),
                    });
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}

fn worker_loop<H: EventHandler>(
    id: DestId,
    mut rx: mpsc::Receiver<Dispatch>,
    mut handler: H,
    mut reduction: Reduction,
) -> EbResult<WorkerReport> {
    let mut report = WorkerReport {
        worker: id,
        nevents: 0,
        nsteps: 0,
        nbatches: 0,
        reduction: reduction.clone(),
        nslow: 0,
    };
    let mut env = EnvStore::default();
    while let Some(Dispatch { batch, ack }) = rx.blocking_recv() {
        report.nbatches += 1;
        for event in Events::from_batch(&batch.data)? {
            if event.is_transition() {
                report.nsteps += 1;
            } else {
                report.nevents += 1;
            }
            report.nslow += env.observe(&event)?;
            handler.handle(&event, &env, &mut reduction).map_err(|e| {
                error!(worker = id, error = %e, "event handler failed");
                EbError::Worker {
                    worker: id,
                    message: e.to_string(),
                }
            })?;
        }
        // the sender may have stopped waiting
        let _ = ack.send(());
    }
    debug!(worker = id, nbatches = report.nbatches, "worker finished");
    report.reduction = reduction;
    Ok(report)
}
