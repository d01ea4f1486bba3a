//! Drive the event builder over one chunk.

use crate::dgram::Timestamp;
use crate::error::EbResult;
use crate::eventbuilder::{BuildOutput, EventBuilder};
use crate::parms::DsParms;
use crate::smd_reader::SmdChunk;
use tracing::debug;

/// Builds every batch of one chunk.
///
/// `accepted` carries the number of events accepted by earlier chunks so the
/// `max_events` limit holds across the whole run.
#[derive(Debug)]
pub struct EventBuilderManager<'p> {
    eb: EventBuilder,
    parms: &'p DsParms,
    accepted: usize,
    min_ts: Option<Timestamp>,
    max_ts: Option<Timestamp>,
    done: bool,
}

impl<'p> EventBuilderManager<'p> {
    /// Manager for `chunk`.
    pub fn new(chunk: &SmdChunk, parms: &'p DsParms, accepted: usize) -> EbResult<Self> {
        Ok(Self {
            eb: EventBuilder::new(&chunk.views, chunk.n_sources())?,
            parms,
            accepted,
            min_ts: None,
            max_ts: None,
            done: false,
        })
    }

    /// Events accepted so far, this chunk included.
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// The `max_events` limit has been reached.
    #[must_use]
    pub fn limit_reached(&self) -> bool {
        self.parms.max_events > 0 && self.accepted >= self.parms.max_events
    }

    /// Smallest timestamp built so far.
    #[must_use]
    pub fn min_ts(&self) -> Option<Timestamp> {
        self.min_ts
    }

    /// Largest timestamp built so far.
    #[must_use]
    pub fn max_ts(&self) -> Option<Timestamp> {
        self.max_ts
    }

    /// Iterator over the batches of this chunk.
    ///
    /// Single pass: once it returns `None` or an error, later calls return
    /// `None`.
    pub fn batches(&mut self) -> Batches<'_, 'p> {
        Batches { manager: self }
    }

    fn next_output(&mut self) -> Option<EbResult<BuildOutput>> {
        if self.done {
            return None;
        }
        if self.limit_reached() {
            debug!(accepted = self.accepted, "max_events reached");
            self.done = true;
            return None;
        }
        let mut budget = self.parms.batch_size;
        if self.parms.max_events > 0 {
            budget = budget.min(self.parms.max_events - self.accepted);
        }
        match self.eb.build(self.parms, budget) {
            Ok(out) if out.is_done() => {
                self.done = true;
                None
            }
            Ok(out) => {
                self.accepted += out.nevents;
                if let Some(ts) = out.min_ts {
                    self.min_ts = Some(self.min_ts.map_or(ts, |m| m.min(ts)));
                }
                if let Some(ts) = out.max_ts {
                    self.max_ts = Some(self.max_ts.map_or(ts, |m| m.max(ts)));
                }
                Some(Ok(out))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Batches of one chunk; see [`EventBuilderManager::batches`].
pub struct Batches<'m, 'p> {
    manager: &'m mut EventBuilderManager<'p>,
}

impl Iterator for Batches<'_, '_> {
    type Item = EbResult<BuildOutput>;

    fn next(&mut self) -> Option<Self::Item> {
        self.manager.next_output()
    }
}
