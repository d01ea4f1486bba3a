//! File-backed runs
//!
//! # Test Coverage
//!
//! - Run discovery and serial building from files on disk
//! - Reader retries on empty reads
//! - Live `.inprogress` files turn final once renamed
//! - Filter and `max_events` in a serial run
//! - Configuration loading from TOML

mod common;

use bytes::Bytes;
use common::{l1, reader, run_stream, stream};
use smd_eb::config::EbConfig;
use smd_eb::run_files::{list_runs, RunFiles};
use smd_eb::source::mock::ScriptedSource;
use smd_eb::source::{ChunkSource, FileSource};
use smd_eb::{run_serial, DsParms, EnvStore, Event, ReaderParams, SmdReader, TransitionId};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;

fn write_run(xtc_dir: &Path, exp: &str, run: u32, streams: &[Bytes]) {
    let smd_dir = xtc_dir.join("smalldata");
    std::fs::create_dir_all(&smd_dir).unwrap();
    for (i, data) in streams.iter().enumerate() {
        let stem = format!("{exp}-r{run:04}-s{i:03}");
        std::fs::write(smd_dir.join(format!("{stem}.smd.xtc2")), data).unwrap();
        std::fs::write(xtc_dir.join(format!("{stem}-c000.xtc2")), b"").unwrap();
    }
}

#[test]
fn test_serial_run_from_disk() {
    use TransitionId::*;
    let dir = TempDir::new().unwrap();
    let xtc_dir = dir.path().join("xtc");
    write_run(&xtc_dir, "tstx00117", 12, &[run_stream(40), run_stream(40)]);
    write_run(&xtc_dir, "tstx00117", 13, &[run_stream(1)]);

    assert_eq!(list_runs(&xtc_dir).unwrap(), vec![12, 13]);
    let files = RunFiles::discover(&xtc_dir, 12).unwrap();
    assert_eq!(files.n_files(), 2);
    assert_eq!(files.xtc_files.len(), 2);
    assert!(!files.live);

    let sources = files
        .smd_files
        .iter()
        .map(|p| Box::new(FileSource::open(p).unwrap()) as Box<dyn ChunkSource>)
        .collect();
    let params = ReaderParams {
        chunk_size: 300,
        max_retries: 0,
        retry_delay: Duration::from_millis(1),
    };
    let reader = SmdReader::new(sources, params).unwrap();

    let mut services = Vec::new();
    let mut full = 0;
    let summary = run_serial(reader, &DsParms::default().with_batch_size(8), |event: &Event, _: &EnvStore| {
        services.push(event.service());
        if event.dgrams().iter().all(Option::is_some) {
            full += 1;
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(summary.nevents, 40);
    assert_eq!(summary.runs, 1);
    assert_eq!(summary.synthesized_endruns, 1);
    assert_eq!(full, services.len());
    assert_eq!(&services[..3], &[Configure, BeginRun, BeginStep]);
    assert_eq!(services.last(), Some(&EndRun));
}

#[test]
fn test_reader_retries_empty_reads() {
    let data = l1(&[1, 2]);
    let source = ScriptedSource::new([Bytes::new(), Bytes::new(), data.clone()]);
    let calls = source.call_counter();
    let params = ReaderParams {
        chunk_size: 1024,
        max_retries: 3,
        retry_delay: Duration::from_millis(1),
    };
    let mut reader = SmdReader::new(vec![Box::new(source)], params).unwrap();

    let chunk = reader.next_chunk().unwrap().unwrap();
    assert_eq!(chunk.views[0], data);
    assert_eq!(calls.load(Ordering::Relaxed), 3);
}

#[test]
fn test_inprogress_file_goes_final() {
    let dir = TempDir::new().unwrap();
    let live = dir.path().join("tstx00117-r0001-s000.smd.xtc2.inprogress");
    std::fs::write(&live, l1(&[1])).unwrap();

    let source = FileSource::open(&live).unwrap();
    assert!(source.is_live());
    std::fs::write(dir.path().join("tstx00117-r0001-s000.smd.xtc2"), b"").unwrap();
    assert!(!source.is_live());
}

#[test]
fn test_serial_filter_and_max_events() {
    use TransitionId::*;
    let data = stream(&[
        (1, BeginRun),
        (2, L1Accept),
        (3, L1Accept),
        (4, L1Accept),
        (5, L1Accept),
        (6, L1Accept),
        (7, EndRun),
    ]);
    let parms = DsParms::default()
        .with_batch_size(2)
        .with_max_events(2)
        .with_filter(|e: &Event| e.timestamp().seconds() % 2 == 0);

    let mut seen = Vec::new();
    let summary = run_serial(reader(vec![data], 1 << 16), &parms, |event: &Event, _: &EnvStore| {
        seen.push(event.timestamp().seconds());
        Ok(())
    })
    .unwrap();

    assert_eq!(seen, vec![1, 2, 4]);
    assert_eq!(summary.nevents, 2);
    assert_eq!(summary.nfiltered, 1);
    assert_eq!(summary.synthesized_endruns, 0);
}

#[test]
fn test_config_from_toml() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("smd_eb.toml");
    std::fs::write(
        &path,
        r#"
[reader]
chunk_size = 4096
retry_delay = "250ms"
live = true

[builder]
batch_size = 50

[distributor]
n_workers = 4
n_eb_nodes = 2
"#,
    )
    .unwrap();

    let config = tokio_test::assert_ok!(EbConfig::load_from(&path));
    tokio_test::assert_ok!(config.validate());
    let parms = DsParms::from_config(&config);
    assert_eq!(parms.batch_size, 50);
    assert_eq!(parms.n_workers, 4);
    assert_eq!(parms.reader.retry_delay, Duration::from_millis(250));
    assert_eq!(parms.reader.max_retries, 3);
    assert!(parms.live);
}
