//! Per-source streaming reader.
//!
//! Every call to [`SmdReader::next_chunk`] performs one read of up to
//! `chunk_size` bytes per source and hands out, for each source, the longest
//! prefix of its buffer made only of complete datagrams. The partial tail
//! stays buffered until a later read completes it.
//!
//! An empty read is retried up to `max_retries` times with `retry_delay`
//! between attempts. Once the budget is spent a source that is not live is at
//! end of file; a live source contributes an empty view and is polled again
//! on the next call.

use crate::config::ReaderConfig;
use crate::dgram::{complete_prefix, complete_prefix_len, decode_all, Timestamp};
use crate::error::{EbError, EbResult};
use crate::packet_footer::PacketFooter;
use crate::source::ChunkSource;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Reader retry and sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderParams {
    /// Bytes requested from each source per call.
    pub chunk_size: usize,
    /// Retries on an empty read.
    pub max_retries: u32,
    /// Sleep between retries.
    pub retry_delay: Duration,
}

impl Default for ReaderParams {
    fn default() -> Self {
        ReaderParams::from(&ReaderConfig::default())
    }
}

impl From<&ReaderConfig> for ReaderParams {
    fn from(config: &ReaderConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_retries: config.effective_max_retries(),
            retry_delay: config.retry_delay,
        }
    }
}

/// One view per source, each holding whole datagrams only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmdChunk {
    /// Per-source views in source order.
    pub views: Vec<Bytes>,
}

impl SmdChunk {
    /// Wrap per-source views.
    #[must_use]
    pub fn new(views: Vec<Bytes>) -> Self {
        Self { views }
    }

    /// Decode a packed chunk.
    pub fn from_packed(buf: &Bytes) -> EbResult<Self> {
        Ok(Self {
            views: PacketFooter::split(buf)?,
        })
    }

    /// Frame the views into one buffer.
    #[must_use]
    pub fn pack(&self) -> Bytes {
        PacketFooter::pack(&self.views)
    }

    /// Number of sources.
    #[must_use]
    pub fn n_sources(&self) -> usize {
        self.views.len()
    }

    /// No source contributed any bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.views.iter().all(Bytes::is_empty)
    }

    /// Total payload bytes over all sources.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.views.iter().map(Bytes::len).sum()
    }

    /// Copy of this chunk with `missing` in front of each source's view.
    pub fn prepend(&self, missing: &[Bytes]) -> EbResult<SmdChunk> {
        if missing.len() != self.views.len() {
            return Err(EbError::format(format!(
                "{} views to prepend to a chunk of {} sources",
                missing.len(),
                self.views.len()
            )));
        }
        if missing.iter().all(Bytes::is_empty) {
            return Ok(self.clone());
        }
        let views = missing
            .iter()
            .zip(&self.views)
            .map(|(m, v)| {
                let mut buf = BytesMut::with_capacity(m.len() + v.len());
                buf.extend_from_slice(m);
                buf.extend_from_slice(v);
                buf.freeze()
            })
            .collect();
        Ok(SmdChunk::new(views))
    }

    /// Per source, the transition datagrams of this chunk concatenated.
    pub fn step_views(&self) -> EbResult<Vec<Bytes>> {
        self.views
            .iter()
            .map(|view| {
                let mut steps = BytesMut::new();
                for dgram in decode_all(view)? {
                    if dgram.is_transition() {
                        steps.extend_from_slice(dgram.as_bytes());
                    }
                }
                Ok(steps.freeze())
            })
            .collect()
    }
}

struct SourceState {
    source: Box<dyn ChunkSource>,
    buf: BytesMut,
    eof: bool,
}

/// Streams complete-datagram chunks from a fixed set of sources.
pub struct SmdReader {
    sources: Vec<SourceState>,
    params: ReaderParams,
    bytes_read: u64,
}

impl SmdReader {
    /// Reader over `sources` in source order.
    pub fn new(sources: Vec<Box<dyn ChunkSource>>, params: ReaderParams) -> EbResult<Self> {
        if sources.is_empty() {
            return Err(EbError::Configuration("reader needs at least one source".into()));
        }
        if params.chunk_size == 0 {
            return Err(EbError::Configuration("chunk_size must be > 0".into()));
        }
        Ok(Self {
            sources: sources
                .into_iter()
                .map(|source| SourceState {
                    source,
                    buf: BytesMut::new(),
                    eof: false,
                })
                .collect(),
            params,
            bytes_read: 0,
        })
    }

    /// Number of sources.
    #[must_use]
    pub fn n_sources(&self) -> usize {
        self.sources.len()
    }

    /// Every source has reached end of file.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.sources.iter().all(|s| s.eof)
    }

    /// Total bytes read from all sources.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Reader parameters.
    #[must_use]
    pub fn params(&self) -> &ReaderParams {
        &self.params
    }

    /// Read the next chunk.
    ///
    /// Returns `Ok(None)` once every source is at end of file and nothing is
    /// left to hand out. A chunk whose views are all empty means the live
    /// sources had nothing new; poll again later.
    ///
    /// Every view stops at the same timestamp: the earliest last complete
    /// timestamp over the sources still being read. Datagrams stamped later
    /// stay buffered, so one timestamp is never split over two chunks. A
    /// source still being read with no complete datagram holds everything
    /// back. Once every source is at end of file the buffers are flushed.
    pub fn next_chunk(&mut self) -> EbResult<Option<SmdChunk>> {
        if self.is_exhausted() && self.sources.iter().all(|s| s.buf.is_empty()) {
            return Ok(None);
        }

        for (i, state) in self.sources.iter_mut().enumerate() {
            if state.eof {
                continue;
            }
            self.bytes_read += read_with_retry(state, &self.params)? as u64;

            if state.eof {
                let n = complete_prefix_len(&state.buf)?;
                if n < state.buf.len() {
                    warn!(
                        source = i,
                        name = %state.source.name(),
                        discarded = state.buf.len() - n,
                        "truncated datagram at end of file"
                    );
                    state.buf.truncate(n);
                }
            }
        }

        let mut limit: Option<Timestamp> = None;
        let mut blocked = false;
        for state in self.sources.iter().filter(|s| !s.eof) {
            match complete_prefix(&state.buf, None)?.last_timestamp {
                Some(ts) => limit = Some(limit.map_or(ts, |l| l.min(ts))),
                None => blocked = true,
            }
        }

        let mut views = Vec::with_capacity(self.sources.len());
        for state in &mut self.sources {
            let n = match (blocked, limit) {
                (true, _) => 0,
                (false, Some(_)) => complete_prefix(&state.buf, limit)?.len,
                (false, None) => state.buf.len(),
            };
            views.push(state.buf.split_to(n).freeze());
        }

        let chunk = SmdChunk::new(views);
        if self.is_exhausted() && chunk.is_empty() {
            debug!(bytes_read = self.bytes_read, "all sources exhausted");
            return Ok(None);
        }
        trace!(
            bytes = chunk.total_bytes(),
            limit = ?limit,
            blocked,
            "chunk ready"
        );
        Ok(Some(chunk))
    }
}

/// One logical read of a source, retrying empty reads. Returns the bytes added.
fn read_with_retry(state: &mut SourceState, params: &ReaderParams) -> EbResult<usize> {
    let mut attempts = 0;
    loop {
        let data = state.source.read(params.chunk_size)?;
        if !data.is_empty() {
            state.buf.extend_from_slice(&data);
            return Ok(data.len());
        }
        if attempts < params.max_retries {
            attempts += 1;
            debug!(
                name = %state.source.name(),
                attempt = attempts,
                max_retries = params.max_retries,
                "empty read, retrying"
            );
            std::thread::sleep(params.retry_delay);
            continue;
        }
        if !state.source.is_live() {
            state.eof = true;
        }
        return Ok(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dgram::{Dgram, TransitionId};
    use crate::source::mock::ScriptedSource;
    use std::sync::atomic::Ordering;
    use tracing_test::traced_test;

    fn dgram(sec: u32, service: TransitionId) -> Bytes {
        Dgram::encode(Timestamp::from_parts(sec, 0), service, 0, b"xyz")
    }

    fn params(max_retries: u32) -> ReaderParams {
        ReaderParams {
            chunk_size: 1024,
            max_retries,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_empty_source_list_rejected() {
        assert!(matches!(
            SmdReader::new(Vec::new(), params(0)),
            Err(EbError::Configuration(_))
        ));
    }

    #[test]
    fn test_retry_then_data() {
        let data = dgram(1, TransitionId::L1Accept);
        let source = ScriptedSource::new([Bytes::new(), Bytes::new(), data.clone()]);
        let calls = source.call_counter();

        let mut reader = SmdReader::new(vec![Box::new(source)], params(3)).unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert_eq!(chunk.views[0], data);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_partial_datagram_completed_next_call() {
        let d1 = dgram(1, TransitionId::L1Accept);
        let d2 = dgram(2, TransitionId::L1Accept);
        let mut stream = d1.to_vec();
        stream.extend_from_slice(&d2);

        let cut = d1.len() + 5;
        let source = ScriptedSource::new([
            Bytes::copy_from_slice(&stream[..cut]),
            Bytes::copy_from_slice(&stream[cut..]),
        ]);
        let mut reader = SmdReader::new(vec![Box::new(source)], params(0)).unwrap();

        assert_eq!(reader.next_chunk().unwrap().unwrap().views[0], d1);
        assert_eq!(reader.next_chunk().unwrap().unwrap().views[0], d2);
        assert!(reader.next_chunk().unwrap().is_none());
        assert!(reader.is_exhausted());
    }

    #[test]
    fn test_live_source_yields_empty_chunk() {
        let source = ScriptedSource::new(Vec::<Bytes>::new()).live(true);
        let mut reader = SmdReader::new(vec![Box::new(source)], params(1)).unwrap();
        let chunk = reader.next_chunk().unwrap().unwrap();
        assert!(chunk.is_empty());
        assert!(!reader.is_exhausted());
    }

    #[test]
    #[traced_test]
    fn test_truncated_tail_discarded_at_eof() {
        let d1 = dgram(1, TransitionId::L1Accept);
        let mut raw = d1.to_vec();
        raw.extend_from_slice(&dgram(2, TransitionId::L1Accept)[..10]);

        let source = ScriptedSource::from_bytes(raw);
        let mut reader = SmdReader::new(vec![Box::new(source)], params(0)).unwrap();
        // first call returns the complete datagram, second call hits EOF
        assert_eq!(reader.next_chunk().unwrap().unwrap().views[0], d1);
        assert!(reader.next_chunk().unwrap().is_none());
        assert!(logs_contain("truncated datagram at end of file"));
    }

    #[test]
    fn test_step_views_keep_only_transitions() {
        let step = dgram(1, TransitionId::BeginStep);
        let mut raw = step.to_vec();
        raw.extend_from_slice(&dgram(2, TransitionId::L1Accept));
        let chunk = SmdChunk::new(vec![Bytes::from(raw), Bytes::new()]);

        let steps = chunk.step_views().unwrap();
        assert_eq!(steps[0], step);
        assert!(steps[1].is_empty());
        assert_eq!(SmdChunk::from_packed(&chunk.pack()).unwrap(), chunk);
    }
}
