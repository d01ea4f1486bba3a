//! Detector lookup from configure metadata.
//!
//! Every source's Configure transition describes the detectors it carries:
//! per detector name, one entry per segment with the detector type, the
//! segment's serial id and the DRP classes (software name and version) that
//! produced its data. [`DetClassTable::build`] turns that into the set of
//! detector implementations the registry can provide; [`config_info`] folds
//! the segments of each detector into a [`ConfigInfo`].

use crate::error::{EbError, EbResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

/// One DRP class of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrpClass {
    /// Class name inside the segment, e.g. `raw` or `fex`.
    pub name: String,
    /// Software name used for lookup.
    pub software: String,
    /// Version components.
    pub version: Vec<u32>,
}

impl DrpClass {
    /// Version joined with underscores.
    #[must_use]
    pub fn version_string(&self) -> String {
        self.version
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// One segment of a detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment id.
    pub segment: u32,
    /// Detector type, e.g. `epix10ka`.
    pub dettype: String,
    /// Segment serial id.
    pub detid: String,
    /// DRP classes of this segment.
    #[serde(default)]
    pub drp_classes: Vec<DrpClass>,
}

/// Detectors described by one source's Configure transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureInfo {
    /// Detector name -> segments.
    #[serde(default)]
    pub detectors: BTreeMap<String, Vec<SegmentInfo>>,
}

impl ConfigureInfo {
    /// Whether this source carries `det_name`.
    #[must_use]
    pub fn has_detector(&self, det_name: &str) -> bool {
        self.detectors.contains_key(det_name)
    }
}

/// Registry lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DetectorKey {
    /// Detector type.
    pub dettype: String,
    /// Software (DRP class) name.
    pub software: String,
    /// Version string, components joined with `_`.
    pub version: String,
}

impl DetectorKey {
    /// Build a key.
    pub fn new(dettype: impl Into<String>, software: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            dettype: dettype.into(),
            software: software.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for DetectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.dettype, self.software, self.version)
    }
}

/// Per-detector information built once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigInfo {
    /// Indices of the sources whose Configure carries this detector.
    pub configs: Vec<usize>,
    /// Segment ids in ascending order.
    pub sorted_segment_ids: Vec<u32>,
    /// Segment id -> serial id.
    pub detid_map: BTreeMap<u32, String>,
    /// Detector type.
    pub device_type: String,
    /// Detector type followed by every segment's serial id, `_`-joined.
    pub unique_id: String,
}

/// A detector implementation produced by the registry.
pub trait Detector: Send + fmt::Debug {
    /// Detector name from the Configure transition.
    fn det_name(&self) -> &str;

    /// DRP class served by this instance.
    fn drp_class(&self) -> &str;

    /// Per-run information.
    fn info(&self) -> &ConfigInfo;
}

/// Detector that only exposes its configuration.
#[derive(Debug, Clone)]
pub struct RawDetector {
    det_name: String,
    drp_class: String,
    info: ConfigInfo,
}

impl Detector for RawDetector {
    fn det_name(&self) -> &str {
        &self.det_name
    }

    fn drp_class(&self) -> &str {
        &self.drp_class
    }

    fn info(&self) -> &ConfigInfo {
        &self.info
    }
}

type DetectorFactory =
    Box<dyn Fn(&str, &str, &ConfigInfo) -> anyhow::Result<Box<dyn Detector>> + Send + Sync>;

/// Detector implementations keyed by `(dettype, software, version)`.
#[derive(Default)]
pub struct DetectorRegistry {
    factories: HashMap<DetectorKey, DetectorFactory>,
}

impl fmt::Debug for DetectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.factories.keys().map(ToString::to_string).collect();
        keys.sort();
        f.debug_struct("DetectorRegistry").field("keys", &keys).finish()
    }
}

impl DetectorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one for `key`.
    pub fn register<F>(&mut self, key: DetectorKey, factory: F)
    where
        F: Fn(&str, &str, &ConfigInfo) -> anyhow::Result<Box<dyn Detector>> + Send + Sync + 'static,
    {
        self.factories.insert(key, Box::new(factory));
    }

    /// Register [`RawDetector`] for `key`.
    pub fn register_raw(&mut self, key: DetectorKey) {
        self.register(key, |det_name, drp_class, info| {
            Ok(Box::new(RawDetector {
                det_name: det_name.to_string(),
                drp_class: drp_class.to_string(),
                info: info.clone(),
            }))
        });
    }

    /// Whether an implementation exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &DetectorKey) -> bool {
        self.factories.contains_key(key)
    }

    /// Instantiate the detector for `key`.
    ///
    /// A missing key is [`EbError::UnsupportedDevice`], which callers may
    /// treat as "skip this detector".
    pub fn create(
        &self,
        key: &DetectorKey,
        det_name: &str,
        drp_class: &str,
        info: &ConfigInfo,
    ) -> EbResult<Box<dyn Detector>> {
        let factory = self.factories.get(key).ok_or_else(|| EbError::UnsupportedDevice {
            dettype: key.dettype.clone(),
            software: key.software.clone(),
            version: key.version.clone(),
        })?;
        factory(det_name, drp_class, info).map_err(|e| {
            EbError::Configuration(format!("detector {det_name}/{drp_class} ({key}): {e}"))
        })
    }
}

/// Group a detector falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DetCategory {
    /// Slow controls.
    Epics,
    /// Scan variables.
    Scan,
    /// Step information.
    Step,
    /// Everything else.
    Normal,
}

impl DetCategory {
    /// Category of a detector name.
    #[must_use]
    pub fn of(det_name: &str) -> Self {
        match det_name {
            "epics" => DetCategory::Epics,
            "scan" => DetCategory::Scan,
            "step" => DetCategory::Step,
            _ => DetCategory::Normal,
        }
    }
}

/// Detector/DRP-class combination seen in the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XtcEntry {
    /// Detector name.
    pub det_name: String,
    /// Detector type.
    pub dettype: String,
    /// DRP class name.
    pub drp_class: String,
    /// Version string.
    pub version: String,
}

/// Detector implementations available for a run.
#[derive(Debug, Clone, Default)]
pub struct DetClassTable {
    /// Category -> (detector name, DRP class) -> registry key.
    pub classes: BTreeMap<DetCategory, BTreeMap<(String, String), DetectorKey>>,
    /// Every combination present in the data, supported or not.
    pub xtc_info: Vec<XtcEntry>,
    /// Detector name -> (detector type, serial id of its last segment).
    pub det_info: BTreeMap<String, (String, String)>,
}

impl DetClassTable {
    /// Collect the supported detector classes of all sources.
    ///
    /// Combinations without a registry entry are listed in `xtc_info` only.
    #[must_use]
    pub fn build(configs: &[ConfigureInfo], registry: &DetectorRegistry) -> Self {
        let mut table = Self::default();
        for config in configs {
            for (det_name, segments) in &config.detectors {
                let Some(first) = segments.first() else {
                    continue;
                };
                let category = table.classes.entry(DetCategory::of(det_name)).or_default();
                for drp in &first.drp_classes {
                    if drp.name.starts_with('_') {
                        continue;
                    }
                    let version = drp.version_string();
                    let entry = XtcEntry {
                        det_name: det_name.clone(),
                        dettype: first.dettype.clone(),
                        drp_class: drp.name.clone(),
                        version: version.clone(),
                    };
                    if !table.xtc_info.contains(&entry) {
                        table.xtc_info.push(entry);
                    }
                    let key = DetectorKey::new(&first.dettype, &drp.software, version);
                    if registry.contains(&key) {
                        category.insert((det_name.clone(), drp.name.clone()), key);
                    } else {
                        debug!(det_name = %det_name, key = %key, "no detector implementation");
                    }
                }
                table
                    .det_info
                    .insert(det_name.clone(), (first.dettype.clone(), first.detid.clone()));
            }
        }
        table
    }

    /// Every (detector name, DRP class, key) in the table.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &DetectorKey)> {
        self.classes
            .values()
            .flatten()
            .map(|((det, drp), key)| (det.as_str(), drp.as_str(), key))
    }
}

/// Fold the segments of every detector in `table` into a [`ConfigInfo`].
#[must_use]
pub fn config_info(configs: &[ConfigureInfo], table: &DetClassTable) -> BTreeMap<String, ConfigInfo> {
    let mut infos = BTreeMap::new();
    for (det_name, _, _) in table.entries() {
        if infos.contains_key(det_name) {
            continue;
        }
        let mut info = ConfigInfo::default();
        for (i, config) in configs.iter().enumerate() {
            let Some(segments) = config.detectors.get(det_name) else {
                continue;
            };
            info.configs.push(i);
            for seg in segments {
                info.sorted_segment_ids.push(seg.segment);
                info.detid_map.insert(seg.segment, seg.detid.clone());
                info.device_type = seg.dettype.clone();
            }
        }
        info.sorted_segment_ids.sort_unstable();
        info.unique_id = std::iter::once(info.device_type.clone())
            .chain(
                info.sorted_segment_ids
                    .iter()
                    .filter_map(|s| info.detid_map.get(s).cloned()),
            )
            .collect::<Vec<_>>()
            .join("_");
        infos.insert(det_name.to_string(), info);
    }
    infos
}

/// Instantiate every supported detector, skipping unsupported ones.
pub fn create_detectors(
    table: &DetClassTable,
    infos: &BTreeMap<String, ConfigInfo>,
    registry: &DetectorRegistry,
) -> EbResult<Vec<Box<dyn Detector>>> {
    let mut detectors = Vec::new();
    for (det_name, drp_class, key) in table.entries() {
        let info = infos.get(det_name).cloned().unwrap_or_default();
        match registry.create(key, det_name, drp_class, &info) {
            Ok(det) => detectors.push(det),
            Err(e) if e.is_recoverable() => {
                debug!(det_name, drp_class, error = %e, "skipping detector");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(detectors)
}

/// Indices of the sources carrying any of `detectors`; all sources when the
/// selection is empty.
#[must_use]
pub fn select_sources(configs: &[ConfigureInfo], detectors: &[String]) -> Vec<usize> {
    if detectors.is_empty() {
        return (0..configs.len()).collect();
    }
    configs
        .iter()
        .enumerate()
        .filter(|(_, c)| detectors.iter().any(|d| c.has_detector(d)))
        .map(|(i, _)| i)
        .collect()
}
