//! Shared helpers for the integration tests.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use smd_eb::source::mock::ScriptedSource;
use smd_eb::source::ChunkSource;
use smd_eb::{Dgram, ReaderParams, SmdReader, Timestamp, TransitionId};
use std::time::Duration;

/// Concatenated datagrams, one per `(seconds, service)`.
pub fn stream(items: &[(u32, TransitionId)]) -> Bytes {
    let mut buf = BytesMut::new();
    for &(sec, service) in items {
        buf.extend_from_slice(&Dgram::encode(Timestamp::from_parts(sec, 0), service, 0, &[]));
    }
    buf.freeze()
}

/// L1Accepts at the given seconds.
pub fn l1(secs: &[u32]) -> Bytes {
    let items: Vec<_> = secs.iter().map(|&s| (s, TransitionId::L1Accept)).collect();
    stream(&items)
}

/// Configure, BeginRun and BeginStep at 1..=3, `n` L1Accepts from 4, then
/// EndStep. No EndRun.
pub fn run_stream(n: u32) -> Bytes {
    use TransitionId::*;
    let mut items = vec![(1, Configure), (2, BeginRun), (3, BeginStep)];
    items.extend((4..4 + n).map(|s| (s, L1Accept)));
    items.push((4 + n, EndStep));
    stream(&items)
}

/// Reader over in-memory sources without retries.
pub fn reader(views: Vec<Bytes>, chunk_size: usize) -> SmdReader {
    let sources = views
        .into_iter()
        .map(|v| Box::new(ScriptedSource::from_bytes(v)) as Box<dyn ChunkSource>)
        .collect();
    SmdReader::new(
        sources,
        ReaderParams {
            chunk_size,
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
        },
    )
    .unwrap()
}
