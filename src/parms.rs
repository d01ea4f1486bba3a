//! Run-time parameters of one data source.

use crate::config::EbConfig;
use crate::dgram::Timestamp;
use crate::error::{EbError, EbResult};
use crate::event::{DestId, Event};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::smd_reader::ReaderParams;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Event filter; `false` drops an ordinary event.
pub type FilterFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Maps an ordinary event to the worker that must process it.
pub type DestinationFn = Arc<dyn Fn(&Event) -> anyhow::Result<DestId> + Send + Sync>;

/// Parameters shared by the reader, builder and distributor.
///
/// Built once per data source and read-only afterwards.
#[derive(Clone)]
pub struct DsParms {
    /// Accepted events per batch.
    pub batch_size: usize,
    /// Stop after this many accepted events; 0 is unlimited.
    pub max_events: usize,
    /// Number of workers that destinations refer to.
    pub n_workers: usize,
    /// Reader sizing and retry budget.
    pub reader: ReaderParams,
    /// Sources are still being written.
    pub live: bool,
    /// Optional filter for ordinary events.
    pub filter: Option<FilterFn>,
    /// Optional destination function; without one batches go round-robin.
    pub destination: Option<DestinationFn>,
    /// Only these timestamps are built when set.
    pub timestamps: Option<Arc<BTreeSet<Timestamp>>>,
    /// Counter sink.
    pub monitor: Arc<dyn MetricsSink>,
}

impl fmt::Debug for DsParms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DsParms")
            .field("batch_size", &self.batch_size)
            .field("max_events", &self.max_events)
            .field("n_workers", &self.n_workers)
            .field("reader", &self.reader)
            .field("live", &self.live)
            .field("filter", &self.filter.is_some())
            .field("destination", &self.destination.is_some())
            .field("timestamps", &self.timestamps.as_ref().map(|t| t.len()))
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl Default for DsParms {
    fn default() -> Self {
        Self::from_config(&EbConfig::default())
    }
}

impl DsParms {
    /// Parameters from a loaded configuration, without callbacks.
    #[must_use]
    pub fn from_config(config: &EbConfig) -> Self {
        Self {
            batch_size: config.builder.batch_size,
            max_events: config.builder.max_events,
            n_workers: config.distributor.n_workers,
            reader: ReaderParams::from(&config.reader),
            live: config.reader.live,
            filter: None,
            destination: None,
            timestamps: None,
            monitor: Arc::new(NoopMetrics),
        }
    }

    /// Set the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the event limit.
    #[must_use]
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Set the number of workers.
    #[must_use]
    pub fn with_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers;
        self
    }

    /// Attach a filter.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Attach a destination function.
    #[must_use]
    pub fn with_destination<F>(mut self, destination: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<DestId> + Send + Sync + 'static,
    {
        self.destination = Some(Arc::new(destination));
        self
    }

    /// Restrict building to the given timestamps.
    #[must_use]
    pub fn with_timestamps(mut self, timestamps: impl IntoIterator<Item = Timestamp>) -> Self {
        self.timestamps = Some(Arc::new(timestamps.into_iter().collect()));
        self
    }

    /// Attach a counter sink.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<dyn MetricsSink>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Check the parameters are usable.
    pub fn validate(&self) -> EbResult<()> {
        if self.batch_size == 0 {
            return Err(EbError::Configuration("batch_size must be > 0".into()));
        }
        if self.n_workers == 0 {
            return Err(EbError::Configuration("n_workers must be > 0".into()));
        }
        if self.reader.chunk_size == 0 {
            return Err(EbError::Configuration("chunk_size must be > 0".into()));
        }
        Ok(())
    }

    /// Destinations that receive broadcast transitions.
    #[must_use]
    pub fn known_destinations(&self) -> Vec<DestId> {
        if self.destination.is_some() {
            (0..self.n_workers).collect()
        } else {
            vec![0]
        }
    }
}
