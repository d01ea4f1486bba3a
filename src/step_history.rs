//! Per-destination transition log.
//!
//! Every transition view the distributor observes is appended to a shared,
//! append-only log. Each destination remembers which log entries it has
//! already received, so [`StepHistory::get_buffer`] can hand a destination
//! exactly the transitions it has missed, including the full history for a
//! destination seen for the first time.
//!
//! Entries stay aligned across sources: every append adds one entry to each
//! source's log, possibly empty.

use crate::error::{EbError, EbResult};
use crate::event::DestId;
use crate::packet_footer::PacketFooter;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default, Clone)]
struct Delivery {
    /// Every entry below this index has been delivered.
    next: usize,
    /// Delivered entries at or above `next`.
    ahead: BTreeSet<usize>,
}

impl Delivery {
    fn pending(&self, len: usize) -> impl Iterator<Item = usize> + '_ {
        (self.next..len).filter(move |i| !self.ahead.contains(i))
    }
}

/// Transition history shared by all destinations of one distributor.
#[derive(Debug, Clone)]
pub struct StepHistory {
    entries: Vec<Vec<Bytes>>,
    delivery: HashMap<DestId, Delivery>,
}

impl StepHistory {
    /// Empty history for `n_sources` sources.
    #[must_use]
    pub fn new(n_sources: usize) -> Self {
        Self {
            entries: vec![Vec::new(); n_sources],
            delivery: HashMap::new(),
        }
    }

    /// Number of sources.
    #[must_use]
    pub fn n_sources(&self) -> usize {
        self.entries.len()
    }

    /// Number of recorded entries per source.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.first().map_or(0, Vec::len)
    }

    /// Nothing recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record transitions observed while sending to `dest`.
    ///
    /// With `as_event` each view is one packet-footer framed event carrying a
    /// part per source; otherwise `views` holds one view per source. The new
    /// entries count as delivered to `dest` only.
    pub fn extend_buffers(&mut self, views: &[Bytes], dest: DestId, as_event: bool) -> EbResult<()> {
        let start = self.len();
        if as_event {
            for event in views {
                let parts = PacketFooter::split(event)?;
                self.push_entry(parts)?;
            }
        } else {
            self.push_entry(views.to_vec())?;
        }
        let end = self.len();

        let delivery = self.delivery.entry(dest).or_default();
        if delivery.next == start && delivery.ahead.is_empty() {
            delivery.next = end;
        } else {
            delivery.ahead.extend(start..end);
        }
        Ok(())
    }

    fn push_entry(&mut self, parts: Vec<Bytes>) -> EbResult<()> {
        if parts.len() != self.entries.len() {
            return Err(EbError::format(format!(
                "transition has {} parts for {} sources",
                parts.len(),
                self.entries.len()
            )));
        }
        for (log, part) in self.entries.iter_mut().zip(parts) {
            log.push(part);
        }
        Ok(())
    }

    /// Per source, the transitions `dest` has not received yet, in recorded
    /// order. They are marked delivered.
    pub fn get_buffer(&mut self, dest: DestId) -> Vec<Bytes> {
        let views = self.peek_buffer(dest);
        self.mark_delivered(dest);
        views
    }

    /// Like [`StepHistory::get_buffer`] without marking anything delivered.
    #[must_use]
    pub fn peek_buffer(&self, dest: DestId) -> Vec<Bytes> {
        let len = self.len();
        let default = Delivery::default();
        let delivery = self.delivery.get(&dest).unwrap_or(&default);
        let pending: Vec<usize> = delivery.pending(len).collect();

        self.entries
            .iter()
            .map(|log| match pending.as_slice() {
                [] => Bytes::new(),
                [only] => log[*only].clone(),
                many => {
                    let mut buf = BytesMut::new();
                    for &i in many {
                        buf.extend_from_slice(&log[i]);
                    }
                    buf.freeze()
                }
            })
            .collect()
    }

    /// Mark everything recorded so far as delivered to `dest`.
    pub fn mark_delivered(&mut self, dest: DestId) {
        let len = self.len();
        let delivery = self.delivery.entry(dest).or_default();
        delivery.next = len;
        delivery.ahead.clear();
    }

    /// Number of entries `dest` has not received.
    #[must_use]
    pub fn pending(&self, dest: DestId) -> usize {
        let len = self.len();
        self.delivery
            .get(&dest)
            .map_or(len, |d| d.pending(len).count())
    }
}
