//! Iterate the events of a finished batch.

use crate::dgram::decode_all;
use crate::error::EbResult;
use crate::event::{Aligner, Event};
use crate::packet_footer::PacketFooter;
use bytes::Bytes;

/// Events of one batch in timestamp order.
///
/// Headers are decoded once when the batch is opened; events are assembled
/// one at a time as the iterator advances.
#[derive(Debug)]
pub struct Events {
    aligner: Aligner,
}

impl Events {
    /// Open a packet-footer framed batch.
    pub fn from_batch(data: &Bytes) -> EbResult<Self> {
        Self::from_views(&PacketFooter::split(data)?)
    }

    /// Open per-source views.
    pub fn from_views(views: &[Bytes]) -> EbResult<Self> {
        let dgrams = views.iter().map(decode_all).collect::<EbResult<Vec<_>>>()?;
        Ok(Self {
            aligner: Aligner::new(dgrams),
        })
    }

    /// Number of sources.
    #[must_use]
    pub fn n_sources(&self) -> usize {
        self.aligner.n_sources()
    }
}

impl Iterator for Events {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        self.aligner.next_event()
    }
}
