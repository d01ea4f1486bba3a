//! Prometheus counters for monitoring.
//!
//! The builder and the distributors only see [`MetricsSink::increment`];
//! [`EbMetrics`] implements it over labeled Prometheus counters so the values
//! can be scraped or read back for a run summary.
//!
//! # Metrics Exposed
//!
//! | metric      | labels                                              |
//! |-------------|-----------------------------------------------------|
//! | `smd0_sent` | `unit` = `evts` / `batches` / `MB` / `seconds`, `point`  |
//! | `eb_sent`   | `unit` = `evts` / `batches` / `MB` / `seconds`, `worker` |
//! | `eb_filter` | `unit` = `evts`, `worker`                           |

use crate::error::EbResult;
use parking_lot::Mutex;
use prometheus::{register_counter_vec_with_registry, CounterVec, Encoder, Registry, TextEncoder};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Chunks sent by the chunk distributor.
pub const SMD0_SENT: &str = "smd0_sent";
/// Batches sent by an event-builder node.
pub const EB_SENT: &str = "eb_sent";
/// Events rejected by the filter.
pub const EB_FILTER: &str = "eb_filter";

/// Receives counter increments.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    /// Add `amount` to the counter identified by `metric` and `labels`.
    fn increment(&self, metric: &str, labels: &[&str], amount: f64);
}

/// Drops every increment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _metric: &str, _labels: &[&str], _amount: f64) {}
}

/// One labeled counter family plus the ids it has seen.
struct Family {
    counters: CounterVec,
    ids: Mutex<BTreeSet<String>>,
}

impl Family {
    fn new(registry: &Registry, name: &str, help: &str, id_label: &str) -> EbResult<Self> {
        let counters = register_counter_vec_with_registry!(name, help, &["unit", id_label], registry)?;
        Ok(Self {
            counters,
            ids: Mutex::new(BTreeSet::new()),
        })
    }
}

/// Event-builder counters registered in a Prometheus [`Registry`].
pub struct EbMetrics {
    registry: Registry,
    smd0_sent: Family,
    eb_sent: Family,
    eb_filter: Family,
}

impl fmt::Debug for EbMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EbMetrics").finish_non_exhaustive()
    }
}

impl EbMetrics {
    /// Counters in a registry of their own.
    pub fn new() -> EbResult<Self> {
        Self::with_registry(&Registry::new())
    }

    /// Counters registered with `registry`.
    pub fn with_registry(registry: &Registry) -> EbResult<Self> {
        Ok(Self {
            registry: registry.clone(),
            smd0_sent: Family::new(registry, SMD0_SENT, "Chunks sent by the chunk distributor", "point")?,
            eb_sent: Family::new(registry, EB_SENT, "Batches sent by event-builder nodes", "worker")?,
            eb_filter: Family::new(registry, EB_FILTER, "Events rejected by the filter", "worker")?,
        })
    }

    /// Registry holding the counters.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn family(&self, metric: &str) -> Option<&Family> {
        match metric {
            SMD0_SENT => Some(&self.smd0_sent),
            EB_SENT => Some(&self.eb_sent),
            EB_FILTER => Some(&self.eb_filter),
            _ => None,
        }
    }

    /// Current value of one counter, 0 if never incremented.
    #[must_use]
    pub fn get(&self, metric: &str, labels: &[&str]) -> f64 {
        self.family(metric)
            .and_then(|f| f.counters.get_metric_with_label_values(labels).ok())
            .map_or(0.0, |c| c.get())
    }

    /// Sum of `metric` over every id for one `unit`.
    #[must_use]
    pub fn total(&self, metric: &str, unit: &str) -> f64 {
        let Some(family) = self.family(metric) else {
            return 0.0;
        };
        let ids = family.ids.lock();
        ids.iter()
            .filter_map(|id| family.counters.get_metric_with_label_values(&[unit, id]).ok())
            .map(|c| c.get())
            .sum()
    }

    /// All counters in the Prometheus text format.
    pub fn encode_text(&self) -> EbResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl MetricsSink for EbMetrics {
    fn increment(&self, metric: &str, labels: &[&str], amount: f64) {
        let Some(family) = self.family(metric) else {
            warn!(metric, "increment of unknown metric");
            return;
        };
        if amount.is_nan() || amount < 0.0 {
            warn!(metric, amount, "counters only go up");
            return;
        }
        match family.counters.get_metric_with_label_values(labels) {
            Ok(counter) => {
                counter.inc_by(amount);
                if let Some(id) = labels.get(1) {
                    family.ids.lock().insert((*id).to_string());
                }
            }
            Err(err) => warn!(metric, error = %err, "counter increment rejected"),
        }
    }
}

/// Record one send: events, one batch, megabytes and elapsed seconds.
pub fn record_sent(
    sink: &dyn MetricsSink,
    metric: &str,
    id: usize,
    nevents: usize,
    nbytes: usize,
    elapsed: Duration,
) {
    let id = id.to_string();
    sink.increment(metric, &["evts", &id], nevents as f64);
    sink.increment(metric, &["batches", &id], 1.0);
    sink.increment(metric, &["MB", &id], nbytes as f64 / 1e6);
    sink.increment(metric, &["seconds", &id], elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = EbMetrics::new().unwrap();
        metrics.increment(EB_SENT, &["evts", "0"], 3.0);
        metrics.increment(EB_SENT, &["evts", "0"], 2.0);
        metrics.increment(EB_SENT, &["evts", "1"], 1.0);
        assert_eq!(metrics.get(EB_SENT, &["evts", "0"]), 5.0);
        assert_eq!(metrics.total(EB_SENT, "evts"), 6.0);
        assert_eq!(metrics.get(EB_SENT, &["batches", "0"]), 0.0);
        assert_eq!(metrics.total(EB_FILTER, "evts"), 0.0);
    }

    #[test]
    fn test_record_sent_labels() {
        let metrics = EbMetrics::new().unwrap();
        record_sent(&metrics, SMD0_SENT, 2, 10, 2_000_000, Duration::from_millis(500));
        assert_eq!(metrics.get(SMD0_SENT, &["evts", "2"]), 10.0);
        assert_eq!(metrics.get(SMD0_SENT, &["batches", "2"]), 1.0);
        assert_eq!(metrics.get(SMD0_SENT, &["MB", "2"]), 2.0);
        assert_eq!(metrics.get(SMD0_SENT, &["seconds", "2"]), 0.5);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("# TYPE smd0_sent counter"));
        assert!(text.contains("point=\"2\""));
    }

    #[test]
    fn test_bad_increments_are_dropped() {
        let metrics = EbMetrics::new().unwrap();
        metrics.increment("nope", &["evts", "0"], 1.0);
        metrics.increment(EB_SENT, &["evts"], 1.0);
        metrics.increment(EB_SENT, &["evts", "0"], -1.0);
        assert_eq!(metrics.total(EB_SENT, "evts"), 0.0);
    }

    #[test]
    fn test_shared_registry_rejects_duplicates() {
        let registry = Registry::new();
        let metrics = EbMetrics::with_registry(&registry).unwrap();
        metrics.increment(EB_FILTER, &["evts", "3"], 2.0);
        assert!(!registry.gather().is_empty());
        assert!(matches!(
            EbMetrics::with_registry(&registry),
            Err(crate::error::EbError::Metrics(_))
        ));
    }
}
