//! Timestamp alignment and batching of one chunk.
//!
//! [`EventBuilder::build`] walks the aligned events of a chunk and sorts them
//! into per-destination batches:
//!
//! - a transition event (any member is a transition) is never filtered; it
//!   goes into the one step batch of the call;
//! - an ordinary event outside the selected timestamps, or rejected by the
//!   filter, is dropped;
//! - an accepted ordinary event goes to the destination chosen by the
//!   destination function (0 without one).
//!
//! Every input datagram lands in at most one output batch. Transitions reach
//! every known destination through [`BuildOutput::delivery`], which merges the
//! step batch into that destination's data in timestamp order.
//!
//! A call returns after `budget` accepted events or when the chunk runs out.
//! A call producing neither events nor steps means the chunk is done.

use crate::dgram::{decode_all, Timestamp};
use crate::error::{EbError, EbResult};
use crate::event::{Aligner, DestId, Event};
use crate::packet_footer::PacketFooter;
use crate::parms::DsParms;
use crate::smd_reader::SmdChunk;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::trace;

/// Packet-footer framed per-source views holding a run of events.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Batch {
    /// Framed buffer, one part per source.
    pub data: Bytes,
    /// Ordinary events in the batch.
    pub nevents: usize,
    /// Transition events in the batch.
    pub nsteps: usize,
}

impl Batch {
    /// Frame per-source views into a batch.
    #[must_use]
    pub fn from_views<B: AsRef<[u8]>>(views: &[B], nevents: usize, nsteps: usize) -> Self {
        Self {
            data: PacketFooter::pack(views),
            nevents,
            nsteps,
        }
    }

    /// Batch made of transitions only, counting its events.
    pub fn steps_only(views: &[Bytes]) -> EbResult<Self> {
        let nsteps = count_events(views)?;
        Ok(Self::from_views(views, 0, nsteps))
    }

    /// Per-source views.
    pub fn views(&self) -> EbResult<Vec<Bytes>> {
        PacketFooter::split(&self.data)
    }

    /// Neither events nor steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nevents == 0 && self.nsteps == 0
    }

    /// Framed size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Copy of this batch with `missing` transitions in front of each source.
    ///
    /// `missing` must have one view per source, possibly empty.
    pub fn prepend(&self, missing: &[Bytes]) -> EbResult<Batch> {
        if missing.iter().all(Bytes::is_empty) {
            return Ok(self.clone());
        }
        let added = count_events(missing)?;
        let joined = SmdChunk::new(self.views()?).prepend(missing)?;
        Ok(Self::from_views(&joined.views, self.nevents, self.nsteps + added))
    }

    /// Copy of this batch with the datagrams of `steps` merged in, per source
    /// and by timestamp. A step goes before data stamped the same.
    pub fn interleave(&self, steps: &Batch) -> EbResult<Batch> {
        let (data, steps_views) = (self.views()?, steps.views()?);
        if data.len() != steps_views.len() {
            return Err(EbError::format(format!(
                "cannot merge {} step views into {} data views",
                steps_views.len(),
                data.len()
            )));
        }
        let mut merged = Vec::with_capacity(data.len());
        for (view, step_view) in data.iter().zip(&steps_views) {
            let (a, b) = (decode_all(view)?, decode_all(step_view)?);
            let mut buf = BytesMut::with_capacity(view.len() + step_view.len());
            let (mut i, mut j) = (0, 0);
            while i < a.len() || j < b.len() {
                let take_step = match (a.get(i), b.get(j)) {
                    (Some(d), Some(s)) => s.timestamp() <= d.timestamp(),
                    (None, _) => true,
                    (_, None) => false,
                };
                if take_step {
                    buf.extend_from_slice(b[j].as_bytes());
                    j += 1;
                } else {
                    buf.extend_from_slice(a[i].as_bytes());
                    i += 1;
                }
            }
            merged.push(buf);
        }
        Ok(Self::from_views(&merged, self.nevents, self.nsteps + steps.nsteps))
    }
}

/// Number of aligned events in per-source views.
pub fn count_events(views: &[Bytes]) -> EbResult<usize> {
    let dgrams = views.iter().map(decode_all).collect::<EbResult<Vec<_>>>()?;
    Ok(Aligner::new(dgrams).count())
}

/// Result of one [`EventBuilder::build`] call.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    /// Ordinary events by destination.
    pub batches: BTreeMap<DestId, Batch>,
    /// Transitions of the call, shared by every destination.
    pub steps: Option<Batch>,
    /// Accepted ordinary events.
    pub nevents: usize,
    /// Transition events.
    pub nsteps: usize,
    /// Ordinary events rejected by the filter.
    pub nfiltered: usize,
    /// Smallest timestamp seen in this call.
    pub min_ts: Option<Timestamp>,
    /// Largest timestamp seen in this call.
    pub max_ts: Option<Timestamp>,
}

impl BuildOutput {
    /// The call produced nothing: the chunk is done.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.nevents == 0 && self.nsteps == 0
    }

    /// Per-source step views of this call, empty when there were none.
    pub fn step_views(&self) -> EbResult<Option<Vec<Bytes>>> {
        self.steps.as_ref().map(Batch::views).transpose()
    }

    /// What `dest` receives from this call: its events with the transitions
    /// merged in. `None` when there is neither.
    pub fn delivery(&self, dest: DestId) -> EbResult<Option<Batch>> {
        match (self.batches.get(&dest), &self.steps) {
            (Some(data), Some(steps)) => data.interleave(steps).map(Some),
            (Some(data), None) => Ok(Some(data.clone())),
            (None, Some(steps)) => Ok(Some(steps.clone())),
            (None, None) => Ok(None),
        }
    }
}

struct PerSource {
    views: Vec<BytesMut>,
    nevents: usize,
    nsteps: usize,
}

impl PerSource {
    fn new(n_sources: usize) -> Self {
        Self {
            views: (0..n_sources).map(|_| BytesMut::new()).collect(),
            nevents: 0,
            nsteps: 0,
        }
    }

    fn append(&mut self, event: &Event) {
        for (buf, slot) in self.views.iter_mut().zip(event.dgrams()) {
            if let Some(d) = slot {
                buf.extend_from_slice(d.as_bytes());
            }
        }
    }

    fn into_batch(self) -> Batch {
        Batch::from_views(&self.views, self.nevents, self.nsteps)
    }
}

/// Builds batches from one chunk of per-source views.
#[derive(Debug)]
pub struct EventBuilder {
    aligner: Aligner,
    n_sources: usize,
}

impl EventBuilder {
    /// Decode every datagram header of `views` (one view per source).
    pub fn new(views: &[Bytes], n_sources: usize) -> EbResult<Self> {
        if n_sources == 0 {
            return Err(EbError::Configuration(
                "event builder needs at least one source".into(),
            ));
        }
        if views.len() != n_sources {
            return Err(EbError::format(format!(
                "chunk has {} views for {n_sources} sources",
                views.len()
            )));
        }
        let dgrams = views.iter().map(decode_all).collect::<EbResult<Vec<_>>>()?;
        Ok(Self {
            aligner: Aligner::new(dgrams),
            n_sources,
        })
    }

    /// Number of sources.
    #[must_use]
    pub fn n_sources(&self) -> usize {
        self.n_sources
    }

    /// Datagrams not yet placed in a batch.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.aligner.remaining()
    }

    /// Build up to `budget` accepted ordinary events.
    ///
    /// A destination callback error, or a destination outside the worker
    /// range, aborts the call.
    pub fn build(&mut self, parms: &DsParms, budget: usize) -> EbResult<BuildOutput> {
        let mut out = BuildOutput::default();
        let mut per_dest: BTreeMap<DestId, PerSource> = BTreeMap::new();
        let mut steps = PerSource::new(self.n_sources);

        while out.nevents < budget {
            let Some(event) = self.aligner.next_event() else {
                break;
            };
            let ts = event.timestamp();
            out.min_ts = Some(out.min_ts.map_or(ts, |m| m.min(ts)));
            out.max_ts = Some(out.max_ts.map_or(ts, |m| m.max(ts)));

            if event.is_transition() {
                steps.append(&event);
                steps.nsteps += 1;
                out.nsteps += 1;
                continue;
            }

            if let Some(selected) = &parms.timestamps {
                if !selected.contains(&ts) {
                    continue;
                }
            }

            if let Some(filter) = &parms.filter {
                if !filter(&event) {
                    out.nfiltered += 1;
                    continue;
                }
            }

            let dest = match &parms.destination {
                Some(destination) => {
                    let dest = destination(&event).map_err(EbError::Destination)?;
                    if dest >= parms.n_workers {
                        return Err(EbError::Destination(anyhow::anyhow!(
                            "destination {dest} outside 0..{}",
                            parms.n_workers
                        )));
                    }
                    dest
                }
                None => 0,
            };
            let batch = per_dest
                .entry(dest)
                .or_insert_with(|| PerSource::new(self.n_sources));
            batch.append(&event);
            batch.nevents += 1;
            out.nevents += 1;
        }

        if out.nsteps > 0 {
            out.steps = Some(steps.into_batch());
        }
        out.batches = per_dest
            .into_iter()
            .map(|(dest, per)| (dest, per.into_batch()))
            .collect();

        trace!(
            nevents = out.nevents,
            nsteps = out.nsteps,
            nfiltered = out.nfiltered,
            ndest = out.batches.len(),
            "build"
        );
        Ok(out)
    }
}
