//! BeginRun/EndRun pairing.
//!
//! ```text
//! SeekingBeginRun --BeginRun--> InRun --EndRun--> SeekingBeginRun
//!                                 |
//!                  BeginRun or end of stream without EndRun
//!                                 v
//!                      synthesize EndRun, log, continue
//! ```
//!
//! A synthesized EndRun is inserted into every source, one microsecond after
//! the latest timestamp seen so far.

use crate::dgram::{decode_all, Dgram, Timestamp, TransitionId};
use crate::error::EbResult;
use crate::smd_reader::SmdChunk;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

/// Global run state across all sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Before the first BeginRun or after an EndRun.
    SeekingBeginRun,
    /// Between BeginRun and EndRun.
    InRun,
}

/// Tracks run boundaries over a stream of chunks and repairs missing EndRuns.
#[derive(Debug)]
pub struct RunTracker {
    state: RunState,
    max_ts: Timestamp,
    last_src: Vec<u32>,
    runs: u64,
    synthesized: u64,
}

impl RunTracker {
    /// Tracker for `n_sources` sources.
    #[must_use]
    pub fn new(n_sources: usize) -> Self {
        Self {
            state: RunState::SeekingBeginRun,
            max_ts: Timestamp::default(),
            last_src: vec![0; n_sources],
            runs: 0,
            synthesized: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Number of BeginRuns seen.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Number of EndRuns synthesized.
    #[must_use]
    pub fn synthesized(&self) -> u64 {
        self.synthesized
    }

    /// Latest timestamp seen in any source.
    #[must_use]
    pub fn max_ts(&self) -> Timestamp {
        self.max_ts
    }

    /// Update the state from `chunk`, inserting an EndRun before any BeginRun
    /// that arrives while a run is still open.
    ///
    /// The chunk is returned unchanged unless an EndRun was inserted.
    pub fn process(&mut self, chunk: SmdChunk) -> EbResult<SmdChunk> {
        let dgrams = chunk
            .views
            .iter()
            .map(decode_all)
            .collect::<EbResult<Vec<_>>>()?;

        let has_beginrun = dgrams
            .iter()
            .flatten()
            .any(|d| d.service() == TransitionId::BeginRun);
        if !has_beginrun {
            for (s, source) in dgrams.iter().enumerate() {
                for d in source {
                    self.observe(s, d);
                }
            }
            if dgrams.iter().flatten().any(|d| d.service() == TransitionId::EndRun) {
                self.state = RunState::SeekingBeginRun;
            }
            return Ok(chunk);
        }

        let n = dgrams.len();
        let mut heads = vec![0usize; n];
        let mut out: Vec<BytesMut> = chunk.views.iter().map(|v| BytesMut::with_capacity(v.len())).collect();
        let mut patched = false;

        while let Some(ts) = (0..n)
            .filter_map(|s| dgrams[s].get(heads[s]).map(Dgram::timestamp))
            .min()
        {
            let group: Vec<usize> = (0..n)
                .filter(|&s| dgrams[s].get(heads[s]).is_some_and(|d| d.timestamp() == ts))
                .collect();
            let services: Vec<TransitionId> =
                group.iter().map(|&s| dgrams[s][heads[s]].service()).collect();

            if services.contains(&TransitionId::BeginRun) {
                if self.state == RunState::InRun {
                    let fake_ts = self.fake_timestamp(Some(ts));
                    warn!(
                        begin_run = %ts,
                        end_run = %fake_ts,
                        "BeginRun inside an open run, inserting EndRun"
                    );
                    for (s, buf) in out.iter_mut().enumerate() {
                        buf.extend_from_slice(Dgram::fake_endrun(fake_ts, self.last_src[s]).as_bytes());
                    }
                    self.synthesized += 1;
                    patched = true;
                }
                self.state = RunState::InRun;
                self.runs += 1;
            }
            if services.contains(&TransitionId::EndRun) {
                self.state = RunState::SeekingBeginRun;
            }

            for &s in &group {
                let d = &dgrams[s][heads[s]];
                out[s].extend_from_slice(d.as_bytes());
                self.last_src[s] = d.header().src;
                heads[s] += 1;
            }
            self.max_ts = self.max_ts.max(ts);
        }

        if !patched {
            return Ok(chunk);
        }
        Ok(SmdChunk::new(out.into_iter().map(BytesMut::freeze).collect()))
    }

    fn observe(&mut self, source: usize, d: &Dgram) {
        if d.service() == TransitionId::BeginRun {
            self.state = RunState::InRun;
            self.runs += 1;
        }
        self.last_src[source] = d.header().src;
        self.max_ts = self.max_ts.max(d.timestamp());
    }

    /// One microsecond after the latest timestamp, kept below `before`.
    fn fake_timestamp(&self, before: Option<Timestamp>) -> Timestamp {
        let ts = self.max_ts.add_micros(1);
        match before {
            Some(limit) if ts >= limit && limit.0 > 0 => Timestamp(limit.0 - 1),
            _ => ts,
        }
    }

    /// Close the stream. Returns EndRuns for every source if a run is open.
    pub fn finish(&mut self) -> Option<SmdChunk> {
        if self.state != RunState::InRun {
            debug!(runs = self.runs, "stream ended outside a run");
            return None;
        }
        let ts = self.fake_timestamp(None);
        warn!(end_run = %ts, "stream ended inside a run, inserting EndRun");
        self.state = RunState::SeekingBeginRun;
        self.synthesized += 1;
        self.max_ts = ts;
        let views: Vec<Bytes> = self
            .last_src
            .iter()
            .map(|&src| Dgram::fake_endrun(ts, src).as_bytes().clone())
            .collect();
        Some(SmdChunk::new(views))
    }
}
