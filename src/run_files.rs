//! Run file discovery.
//!
//! Runs are stored as `<exp>-r<NNNN>-s<SSS>[-c<CCC>].xtc2` in the experiment's
//! `xtc/` directory, with one small-data file per stream in
//! `xtc/smalldata/<exp>-r<NNNN>-s<SSS>.smd.xtc2`. Files still being written
//! carry an extra `.inprogress` suffix.

use crate::error::{EbError, EbResult};
use crate::source::INPROGRESS_SUFFIX;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Environment variable naming the data root.
pub const DATA_ROOT_ENV: &str = "SIT_PSDM_DATA";

/// Data root used when the environment does not name one.
pub const DEFAULT_DATA_ROOT: &str = "/reg/d/psdm";

fn smd_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<stem>.*-r(?P<run>\d{4})-s\d+)\.smd\.xtc2(?P<live>\.inprogress)?$")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

fn run_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"-r(?P<run>\d+)-").unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

fn chunk_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"-c(?P<chunk>\d{3})").unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

/// The `xtc/` directory of an experiment under `data_root`.
///
/// Experiments are grouped by the first three letters of their name
/// (the instrument).
#[must_use]
pub fn experiment_xtc_dir(data_root: &Path, exp: &str) -> PathBuf {
    let instrument: String = exp.chars().take(3).collect();
    data_root.join(instrument).join(exp).join("xtc")
}

/// Data root from the environment, falling back to [`DEFAULT_DATA_ROOT`].
#[must_use]
pub fn data_root() -> PathBuf {
    std::env::var_os(DATA_ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT))
}

/// Chunk index of a big-data file: the three digits after `-c`.
#[must_use]
pub fn chunk_id(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    chunk_re()
        .captures(name)
        .and_then(|c| c["chunk"].parse().ok())
}

/// Name of the same file with chunk index `chunk` instead of its current one.
#[must_use]
pub fn with_chunk_id(path: &Path, chunk: u32) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let replaced = chunk_re().replace(name, format!("-c{chunk:03}").as_str());
    Some(path.with_file_name(replaced.as_ref()))
}

/// Files making up one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFiles {
    /// Run number.
    pub run: u32,
    /// Small-data files, one per stream, in stream order.
    pub smd_files: Vec<PathBuf>,
    /// Big-data files that exist on disk, matched to `smd_files` by stream.
    pub xtc_files: Vec<PathBuf>,
    /// The run is still being written.
    pub live: bool,
}

impl RunFiles {
    /// Locate the files of `run` in `xtc_dir`.
    ///
    /// When any `.inprogress` small-data file exists, only `.inprogress`
    /// files are used and the run is live.
    pub fn discover(xtc_dir: &Path, run: u32) -> EbResult<Self> {
        let smd_dir = xtc_dir.join("smalldata");
        let mut finished = Vec::new();
        let mut inprogress = Vec::new();

        for entry in std::fs::read_dir(&smd_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(caps) = smd_name_re().captures(name) else {
                continue;
            };
            if caps["run"].parse::<u32>().ok() != Some(run) {
                continue;
            }
            if caps.name("live").is_some() {
                inprogress.push(path);
            } else {
                finished.push(path);
            }
        }

        let live = !inprogress.is_empty();
        let mut smd_files = if live { inprogress } else { finished };
        smd_files.sort();

        if smd_files.is_empty() {
            return Err(EbError::Configuration(format!(
                "no small-data files for run {run} in {}",
                smd_dir.display()
            )));
        }

        let ext = if live {
            format!(".xtc2{INPROGRESS_SUFFIX}")
        } else {
            ".xtc2".to_string()
        };
        let bigdata = |suffix: &str| -> Vec<PathBuf> {
            smd_files
                .iter()
                .filter_map(|smd| {
                    let name = smd.file_name()?.to_str()?;
                    let stem = smd_name_re().captures(name)?.name("stem")?.as_str().to_string();
                    let candidate = xtc_dir.join(format!("{stem}{suffix}{ext}"));
                    candidate.is_file().then_some(candidate)
                })
                .collect()
        };
        let mut xtc_files = bigdata("");
        if xtc_files.is_empty() {
            debug!(run, "no unchunked big-data files, trying chunk 0");
            xtc_files = bigdata("-c000");
        }

        debug!(run, live, smd = smd_files.len(), xtc = xtc_files.len(), "discovered run files");
        Ok(Self {
            run,
            smd_files,
            xtc_files,
            live,
        })
    }

    /// Number of streams.
    #[must_use]
    pub fn n_files(&self) -> usize {
        self.smd_files.len()
    }
}

/// Run numbers with at least one big-data or small-data file in `xtc_dir`.
pub fn list_runs(xtc_dir: &Path) -> EbResult<Vec<u32>> {
    let mut runs = BTreeSet::new();
    for dir in [xtc_dir.to_path_buf(), xtc_dir.join("smalldata")] {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.contains(".xtc2") {
                continue;
            }
            if let Some(run) = run_number_re()
                .captures(name)
                .and_then(|c| c["run"].parse().ok())
            {
                runs.insert(run);
            }
        }
    }
    Ok(runs.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_chunk_id() {
        assert_eq!(chunk_id(Path::new("/d/tst-r0014-s001-c002.xtc2")), Some(2));
        assert_eq!(chunk_id(Path::new("tst-r0014-s001-c120.xtc2.inprogress")), Some(120));
        assert_eq!(chunk_id(Path::new("tst-r0014-s001.xtc2")), None);
        assert_eq!(
            with_chunk_id(Path::new("/d/tst-r0014-s001-c002.xtc2"), 3).unwrap(),
            PathBuf::from("/d/tst-r0014-s001-c003.xtc2")
        );
    }

    #[test]
    fn test_experiment_dir() {
        assert_eq!(
            experiment_xtc_dir(Path::new("/data"), "tmoc00118"),
            PathBuf::from("/data/tmo/tmoc00118/xtc")
        );
    }

    #[test]
    fn test_discover_finished_run() {
        let dir = tempfile::tempdir().unwrap();
        let xtc = dir.path();
        touch(&xtc.join("smalldata/tst-r0003-s001.smd.xtc2"));
        touch(&xtc.join("smalldata/tst-r0003-s000.smd.xtc2"));
        touch(&xtc.join("smalldata/tst-r0004-s000.smd.xtc2"));
        touch(&xtc.join("tst-r0003-s000.xtc2"));
        touch(&xtc.join("tst-r0003-s001.xtc2"));

        let files = RunFiles::discover(xtc, 3).unwrap();
        assert!(!files.live);
        assert_eq!(files.n_files(), 2);
        assert!(files.smd_files[0].ends_with("tst-r0003-s000.smd.xtc2"));
        assert!(files.xtc_files[1].ends_with("tst-r0003-s001.xtc2"));
    }

    #[test]
    fn test_discover_prefers_inprogress_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let xtc = dir.path();
        touch(&xtc.join("smalldata/tst-r0007-s000.smd.xtc2"));
        touch(&xtc.join("smalldata/tst-r0007-s000.smd.xtc2.inprogress"));
        touch(&xtc.join("tst-r0007-s000-c000.xtc2.inprogress"));

        let files = RunFiles::discover(xtc, 7).unwrap();
        assert!(files.live);
        assert_eq!(files.smd_files.len(), 1);
        assert!(files.smd_files[0].to_string_lossy().ends_with(".inprogress"));
        assert_eq!(files.xtc_files.len(), 1);
        assert_eq!(chunk_id(&files.xtc_files[0]), Some(0));
    }

    #[test]
    fn test_discover_missing_run() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("smalldata/tst-r0001-s000.smd.xtc2"));
        assert!(matches!(
            RunFiles::discover(dir.path(), 2),
            Err(EbError::Configuration(_))
        ));
    }

    #[test]
    fn test_list_runs() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("tst-r0012-s000.xtc2"));
        touch(&dir.path().join("tst-r0002-s000-c000.xtc2"));
        touch(&dir.path().join("smalldata/tst-r0012-s001.smd.xtc2"));
        touch(&dir.path().join("notes.txt"));
        assert_eq!(list_runs(dir.path()).unwrap(), vec![2, 12]);
    }
}
