//! Composite events and timestamp alignment.

use crate::dgram::{Dgram, Timestamp, TransitionId};
use crate::error::{EbError, EbResult};
use crate::packet_footer::PacketFooter;
use bytes::Bytes;
use std::collections::VecDeque;

/// Destination (worker rank) identifier.
pub type DestId = usize;

/// One slot per source, all present datagrams sharing one timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    timestamp: Timestamp,
    dgrams: Vec<Option<Dgram>>,
}

impl Event {
    /// Build an event from per-source slots.
    ///
    /// At least one slot must be filled and every filled slot must carry
    /// `timestamp`.
    pub fn new(timestamp: Timestamp, dgrams: Vec<Option<Dgram>>) -> EbResult<Self> {
        if dgrams.iter().all(Option::is_none) {
            return Err(EbError::format("event without datagrams"));
        }
        if let Some(d) = dgrams.iter().flatten().find(|d| d.timestamp() != timestamp) {
            return Err(EbError::format(format!(
                "datagram at {} in event at {timestamp}",
                d.timestamp()
            )));
        }
        Ok(Self { timestamp, dgrams })
    }

    /// Decode a packet-footer framed event (one part per source, empty part
    /// for a missing source).
    pub fn from_packed(buf: &Bytes) -> EbResult<Self> {
        let dgrams = PacketFooter::split(buf)?
            .into_iter()
            .map(|part| (!part.is_empty()).then(|| Dgram::from_bytes(part)).transpose())
            .collect::<EbResult<Vec<_>>>()?;
        let timestamp = dgrams
            .iter()
            .flatten()
            .map(Dgram::timestamp)
            .next()
            .ok_or_else(|| EbError::format("event without datagrams"))?;
        Self::new(timestamp, dgrams)
    }

    /// Frame the event, one part per source.
    #[must_use]
    pub fn pack(&self) -> Bytes {
        let parts: Vec<Bytes> = self
            .dgrams
            .iter()
            .map(|d| d.as_ref().map(|d| d.as_bytes().clone()).unwrap_or_default())
            .collect();
        PacketFooter::pack(&parts)
    }

    /// Group timestamp.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Per-source slots.
    #[must_use]
    pub fn dgrams(&self) -> &[Option<Dgram>] {
        &self.dgrams
    }

    /// Datagram of source `i`, if present.
    #[must_use]
    pub fn dgram(&self, i: usize) -> Option<&Dgram> {
        self.dgrams.get(i).and_then(Option::as_ref)
    }

    /// Number of source slots.
    #[must_use]
    pub fn n_sources(&self) -> usize {
        self.dgrams.len()
    }

    /// Total datagram bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.dgrams.iter().flatten().map(Dgram::size).sum()
    }

    /// Service of the first transition member, or L1Accept.
    #[must_use]
    pub fn service(&self) -> TransitionId {
        self.dgrams
            .iter()
            .flatten()
            .map(Dgram::service)
            .find(|s| s.is_transition())
            .unwrap_or(TransitionId::L1Accept)
    }

    /// A transition event has at least one transition member.
    #[must_use]
    pub fn is_transition(&self) -> bool {
        self.service().is_transition()
    }
}

/// Greedy timestamp alignment over per-source datagram queues.
///
/// Each step takes every source whose next datagram has the smallest
/// timestamp; the other sources get an empty slot.
#[derive(Debug)]
pub struct Aligner {
    queues: Vec<VecDeque<Dgram>>,
}

impl Aligner {
    /// Align the given per-source datagram sequences.
    #[must_use]
    pub fn new(sources: Vec<Vec<Dgram>>) -> Self {
        Self {
            queues: sources.into_iter().map(VecDeque::from).collect(),
        }
    }

    /// Number of sources.
    #[must_use]
    pub fn n_sources(&self) -> usize {
        self.queues.len()
    }

    /// Datagrams not yet grouped.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    /// Timestamp of the next group.
    #[must_use]
    pub fn peek_timestamp(&self) -> Option<Timestamp> {
        self.queues
            .iter()
            .filter_map(|q| q.front().map(Dgram::timestamp))
            .min()
    }

    /// Pop the next event.
    pub fn next_event(&mut self) -> Option<Event> {
        let ts = self.peek_timestamp()?;
        let dgrams = self
            .queues
            .iter_mut()
            .map(|q| {
                if q.front().is_some_and(|d| d.timestamp() == ts) {
                    q.pop_front()
                } else {
                    None
                }
            })
            .collect();
        Some(Event {
            timestamp: ts,
            dgrams,
        })
    }
}

impl Iterator for Aligner {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.next_event()
    }
}
