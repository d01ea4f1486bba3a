//! CLI Entry Point for smd-eb
//!
//! Provides command-line interface for:
//! - Building and distributing the events of a run (`run`)
//! - Listing the datagrams of one small-data file (`dump`)
//! - Listing the runs of an experiment (`runs`)
//!
//! # Usage
//!
//! Build a run from explicit files:
//! ```bash
//! smd-eb run data/smalldata/*.smd.xtc2 --workers 4
//! ```
//!
//! Build a run of an experiment under the data root:
//! ```bash
//! smd-eb run --exp tmoc00118 --run 123 --eb-nodes 2 --workers 4
//! ```
//!
//! Inspect a file:
//! ```bash
//! smd-eb dump data/smalldata/tmoc00118-r0123-s000.smd.xtc2 --limit 20
//! ```

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use smd_eb::config::{EbConfig, DEFAULT_CONFIG_PATH};
use smd_eb::detector::{config_info, select_sources, ConfigureInfo, DetClassTable, DetectorKey, DetectorRegistry};
use smd_eb::dgram::decode_all;
use smd_eb::metrics::{EbMetrics, EB_FILTER, EB_SENT, SMD0_SENT};
use smd_eb::reduction::{ReduceOp, Reduction};
use smd_eb::run_files::{data_root, experiment_xtc_dir, list_runs, RunFiles};
use smd_eb::source::{ChunkSource, FileSource};
use smd_eb::{logging, run_distributed, run_serial, DsParms, EnvStore, Event, ReaderParams, RunSummary, SmdReader, Topology};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "smd-eb")]
#[command(about = "Small-data event builder", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and distribute the events of a run
    Run {
        /// Small-data files, one per stream
        files: Vec<PathBuf>,

        /// Experiment name (uses the data root)
        #[arg(long)]
        exp: Option<String>,

        /// Run number, with --exp or --dir
        #[arg(long)]
        run: Option<u32>,

        /// Explicit xtc directory instead of the data root
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Number of workers
        #[arg(long)]
        workers: Option<usize>,

        /// Number of event-builder nodes
        #[arg(long)]
        eb_nodes: Option<usize>,

        /// Accepted events per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Stop after this many events
        #[arg(long)]
        max_events: Option<usize>,

        /// Reduction applied to event sizes (sum, product, min, max)
        #[arg(long, default_value = "sum")]
        reduce: ReduceOp,

        /// Build on one thread without workers
        #[arg(long)]
        serial: bool,

        /// Only read streams carrying these detectors
        #[arg(long, value_delimiter = ',')]
        detectors: Vec<String>,

        /// TOML file with the configure metadata of every stream
        #[arg(long)]
        configure_info: Option<PathBuf>,
    },

    /// List the datagrams of a small-data file
    Dump {
        /// File to read
        file: PathBuf,

        /// Stop after this many datagrams
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List the runs of an experiment
    Runs {
        /// Experiment name (uses the data root)
        #[arg(long)]
        exp: Option<String>,

        /// Explicit xtc directory
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

/// Configure metadata of every stream, in stream order.
#[derive(Debug, Deserialize)]
struct StreamsInfo {
    streams: Vec<ConfigureInfo>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EbConfig::load_from(&cli.config)?;
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Run {
            files,
            exp,
            run,
            dir,
            workers,
            eb_nodes,
            batch_size,
            max_events,
            reduce,
            serial,
            detectors,
            configure_info,
        } => {
            let mut config = config;
            if let Some(n) = workers {
                config.distributor.n_workers = n;
            }
            if let Some(n) = eb_nodes {
                config.distributor.n_eb_nodes = n;
            }
            if let Some(n) = batch_size {
                config.builder.batch_size = n;
            }
            if let Some(n) = max_events {
                config.builder.max_events = n;
            }
            let (files, live) = resolve_files(files, exp, run, dir)?;
            if live {
                config.reader.live = true;
            }
            config.validate()?;
            let files = select_files(files, &detectors, configure_info.as_deref())?;
            run_files(&config, &files, reduce, serial).await
        }
        Commands::Dump { file, limit } => dump(&file, limit),
        Commands::Runs { exp, dir } => {
            let xtc_dir = xtc_dir(exp, dir)?;
            for run in list_runs(&xtc_dir)? {
                println!("{run}");
            }
            Ok(())
        }
    }
}

fn xtc_dir(exp: Option<String>, dir: Option<PathBuf>) -> Result<PathBuf> {
    match (dir, exp) {
        (Some(dir), _) => Ok(dir),
        (None, Some(exp)) => Ok(experiment_xtc_dir(&data_root(), &exp)),
        (None, None) => bail!("either --exp or --dir is required"),
    }
}

fn resolve_files(
    files: Vec<PathBuf>,
    exp: Option<String>,
    run: Option<u32>,
    dir: Option<PathBuf>,
) -> Result<(Vec<PathBuf>, bool)> {
    if !files.is_empty() {
        return Ok((files, false));
    }
    let Some(run) = run else {
        bail!("give small-data files or --run with --exp/--dir");
    };
    let found = RunFiles::discover(&xtc_dir(exp, dir)?, run)?;
    println!(
        "📂 Run {}: {} streams{}",
        found.run,
        found.n_files(),
        if found.live { " (live)" } else { "" }
    );
    Ok((found.smd_files, found.live))
}

fn select_files(files: Vec<PathBuf>, detectors: &[String], configure_info: Option<&Path>) -> Result<Vec<PathBuf>> {
    let Some(path) = configure_info else {
        if !detectors.is_empty() {
            bail!("--detectors needs --configure-info");
        }
        return Ok(files);
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let info: StreamsInfo = toml::from_str(&text)?;
    if info.streams.len() != files.len() {
        bail!("{} configure entries for {} streams", info.streams.len(), files.len());
    }

    // every DRP class present can at least be read raw
    let mut registry = DetectorRegistry::new();
    for stream in &info.streams {
        for segments in stream.detectors.values() {
            for seg in segments {
                for drp in &seg.drp_classes {
                    registry.register_raw(DetectorKey::new(&seg.dettype, &drp.software, drp.version_string()));
                }
            }
        }
    }
    let table = DetClassTable::build(&info.streams, &registry);
    for (det_name, det) in config_info(&info.streams, &table) {
        if detectors.is_empty() || detectors.contains(&det_name) {
            println!("🔎 {det_name}: {} ({} segments)", det.unique_id, det.sorted_segment_ids.len());
        }
    }

    let selected = select_sources(&info.streams, detectors);
    if selected.is_empty() {
        bail!("no stream carries {}", detectors.join(", "));
    }
    Ok(selected.into_iter().map(|i| files[i].clone()).collect())
}

fn open_reader(config: &EbConfig, files: &[PathBuf]) -> Result<SmdReader> {
    let sources = files
        .iter()
        .map(|f| FileSource::open(f).map(|s| Box::new(s) as Box<dyn ChunkSource>))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SmdReader::new(sources, ReaderParams::from(&config.reader))?)
}

async fn run_files(config: &EbConfig, files: &[PathBuf], reduce: ReduceOp, serial: bool) -> Result<()> {
    let reader = open_reader(config, files)?;
    let registry = Arc::new(EbMetrics::new()?);
    let parms = DsParms::from_config(config).with_monitor(registry.clone());

    println!("▶️  Building {} streams", files.len());
    let summary = if serial {
        let mut reduction = Reduction::new(reduce, 1);
        let (mut summary, reduction) = tokio::task::spawn_blocking(move || {
            let summary = run_serial(reader, &parms, |event: &Event, _: &EnvStore| {
                if !event.is_transition() {
                    reduction.accumulate(0, event.size() as f64);
                }
                Ok(())
            })?;
            Ok::<_, smd_eb::EbError>((summary, reduction))
        })
        .await??;
        summary.reduction = Some(reduction);
        summary
    } else {
        run_distributed(
            reader,
            parms,
            Topology::from(&config.distributor),
            Reduction::new(reduce, 1),
            |_| {
                |event: &Event, _: &EnvStore, reduction: &mut Reduction| -> anyhow::Result<()> {
                    if !event.is_transition() {
                        reduction.accumulate(0, event.size() as f64);
                    }
                    Ok(())
                }
            },
        )
        .await?
    };

    print_summary(&summary, &registry);
    Ok(())
}

fn print_summary(summary: &RunSummary, registry: &EbMetrics) {
    println!();
    println!("✅ Run complete");
    println!("   Events:    {}", summary.nevents);
    println!("   Steps:     {}", summary.nsteps);
    println!("   Filtered:  {}", summary.nfiltered);
    println!("   Batches:   {}", summary.nbatches);
    println!("   Runs:      {} ({} EndRun inserted)", summary.runs, summary.synthesized_endruns);
    if let Some(reduction) = &summary.reduction {
        println!("   Reduction: {:?} {:?}", reduction.op(), reduction.values());
    }
    for worker in &summary.workers {
        println!(
            "   Worker {}: {} events, {} steps, {} batches",
            worker.worker, worker.nevents, worker.nsteps, worker.nbatches
        );
    }
    if !summary.workers.is_empty() {
        println!(
            "   Sent: smd0 {:.3} MB, eb {:.3} MB, filtered {}",
            registry.total(SMD0_SENT, "MB"),
            registry.total(EB_SENT, "MB"),
            registry.total(EB_FILTER, "evts")
        );
    }
}

fn dump(path: &Path, limit: Option<usize>) -> Result<()> {
    let data = Bytes::from(std::fs::read(path).with_context(|| format!("reading {}", path.display()))?);
    let dgrams = decode_all(&data)?;
    println!("{}: {} datagrams", path.display(), dgrams.len());
    for (i, d) in dgrams.iter().take(limit.unwrap_or(usize::MAX)).enumerate() {
        println!("{i:8} {} {:>8} {}", d.timestamp(), d.size(), d.service());
    }
    Ok(())
}
