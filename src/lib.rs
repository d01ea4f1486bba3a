//! # Small-Data Event Builder
//!
//! This crate reads per-detector streams of small-data XTC datagrams, aligns
//! them by timestamp into events, groups events into batches and hands the
//! batches to workers. Run boundaries are repaired on the way and every worker
//! is guaranteed to see each transition (Configure, BeginRun, BeginStep, ...)
//! exactly once and before the data it precedes.
//!
//! ## Crate Structure
//!
//! - **`dgram`** / **`packet_footer`**: the datagram header codec and the
//!   framing used to bundle one view per source into a single buffer.
//! - **`source`** / **`run_files`**: chunk sources (files, live files, the
//!   pooled shared-memory transport) and run file discovery.
//! - **`smd_reader`**: turns sources into chunks of whole datagrams, retrying
//!   empty reads.
//! - **`run_state`**: BeginRun/EndRun pairing; inserts a missing EndRun.
//! - **`event`** / **`events`** / **`eventbuilder`** /
//!   **`eventbuilder_manager`**: timestamp alignment and batching.
//! - **`step_history`**: per-destination bookkeeping of delivered
//!   transitions.
//! - **`node`** / **`worker`** / **`run`**: the Smd0 distributor,
//!   event-builder nodes, the worker pool and the whole-run drivers.
//! - **`parms`**: run-time parameters and user callbacks.
//! - **`detector`** / **`env_store`** / **`reduction`**: detector registry,
//!   slow-data lookup and worker accumulators.
//! - **`config`** / **`logging`** / **`metrics`** / **`error`**: ambient
//!   configuration, tracing setup, counters and the crate error type.

pub mod config;
pub mod detector;
pub mod dgram;
pub mod env_store;
pub mod error;
pub mod event;
pub mod eventbuilder;
pub mod eventbuilder_manager;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod packet_footer;
pub mod parms;
pub mod reduction;
pub mod run;
pub mod run_files;
pub mod run_state;
pub mod smd_reader;
pub mod source;
pub mod step_history;
pub mod worker;

pub use config::EbConfig;
pub use dgram::{Dgram, Timestamp, TransitionId};
pub use env_store::EnvStore;
pub use error::{EbError, EbResult};
pub use event::{DestId, Event};
pub use eventbuilder::{Batch, BuildOutput, EventBuilder};
pub use eventbuilder_manager::EventBuilderManager;
pub use packet_footer::PacketFooter;
pub use parms::DsParms;
pub use run::{run_distributed, run_serial, RunSummary, Topology};
pub use smd_reader::{ReaderParams, SmdChunk, SmdReader};
pub use step_history::StepHistory;
