//! Target aggregate + `fuse.json` descriptor
//!
//! `Target` is the passive data bag spec.md §3 describes: case-folder paths,
//! runtime, target events, reference sets, BC/minimal sequences, repeat
//! counters, the combined-profile registry and the `Statistics` accumulator.
//! All orchestration behavior lives in `orchestrator.rs`, not here, mirroring
//! the source's `Fuse::Target` (storage) / `fuse.cpp` (behavior) split.
//! Grounded on `hud/src/domain/mod.rs`'s serde-descriptor + validated-domain
//! struct split: a private `TargetDescriptor` mirrors `fuse.json` 1:1, and
//! `Target::load` turns it into the validated form below.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::errors::EngineError;
use crate::domain::types::{normalize, Event, Runtime, Strategy};
use crate::sequence::{CombinationSequence, SequencePart};
use crate::statistics::Statistics;

#[derive(Debug, Default, Deserialize, Serialize)]
struct SequencePartDescriptor {
    #[serde(default)]
    overlapping: Vec<String>,
    #[serde(default)]
    unique: Vec<String>,
}

/// Mirrors `fuse.json` exactly; every field optional here so that missing
/// *required* keys are reported as a descriptive `InvalidConfig` rather than
/// a generic serde parse failure.
#[derive(Debug, Default, Deserialize, Serialize)]
struct TargetDescriptor {
    binary: Option<String>,
    binary_directory: Option<String>,
    runtime: Option<String>,
    target_events: Option<Vec<String>>,
    references_directory: Option<String>,
    tracefiles_directory: Option<String>,
    combinations_directory: Option<String>,
    papi_directory: Option<String>,

    #[serde(default)]
    args: String,
    #[serde(default)]
    should_clear_cache: bool,
    #[serde(default)]
    num_reference_repeats: u32,
    #[serde(default)]
    num_bc_sequence_repeats: u32,
    #[serde(default)]
    num_minimal_sequence_repeats: u32,
    #[serde(default)]
    reference_sets: Vec<Vec<String>>,
    #[serde(default)]
    combined_indexes: HashMap<String, Vec<u32>>,
    #[serde(default)]
    bc_sequence: Vec<SequencePartDescriptor>,
    #[serde(default)]
    minimal_sequence: Vec<SequencePartDescriptor>,
}

fn require<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, EngineError> {
    field.as_deref().ok_or_else(|| EngineError::InvalidConfig(format!("fuse.json is missing required field '{name}'")))
}

fn parts_from_descriptor(parts: Vec<SequencePartDescriptor>, minimal: bool) -> Result<CombinationSequence, EngineError> {
    let parts = parts
        .into_iter()
        .enumerate()
        .map(|(idx, part)| SequencePart {
            #[allow(clippy::cast_possible_truncation)]
            part_index: idx as u32,
            overlapping: part.overlapping.iter().map(|e| normalize(e)).collect(),
            unique: part.unique.iter().map(|e| normalize(e)).collect(),
        })
        .collect();
    let sequence = CombinationSequence { parts, minimal };
    sequence.validate()?;
    Ok(sequence)
}

fn parts_to_descriptor(sequence: &CombinationSequence) -> Vec<SequencePartDescriptor> {
    sequence
        .parts
        .iter()
        .map(|part| SequencePartDescriptor { overlapping: part.overlapping.clone(), unique: part.unique.clone() })
        .collect()
}

/// The user-visible aggregate a CLI invocation operates on. See spec.md §3.
pub struct Target {
    case_folder: PathBuf,

    binary: String,
    binary_directory: PathBuf,
    runtime: Runtime,
    target_events: Vec<Event>,
    args: String,
    should_clear_cache: bool,

    references_directory: PathBuf,
    tracefiles_directory: PathBuf,
    combinations_directory: PathBuf,
    papi_directory: PathBuf,

    reference_sets: Vec<Vec<Event>>,
    num_reference_repeats: u32,

    bc_sequence: CombinationSequence,
    minimal_sequence: CombinationSequence,
    num_bc_sequence_repeats: u32,
    num_minimal_sequence_repeats: u32,

    combined_profiles: HashMap<Strategy, Vec<u32>>,

    statistics: Statistics,
}

impl Target {
    /// Loads `<case_folder>/fuse.json`, validates it per spec.md §6, and
    /// scaffolds (idempotently) the three working directories it names —
    /// no production collaborator creates them, and every orchestrator
    /// operation writes straight into them (see `DESIGN.md`).
    pub fn load(case_folder: &Path) -> Result<Self, EngineError> {
        let descriptor_path = case_folder.join("fuse.json");
        let contents = std::fs::read_to_string(&descriptor_path).map_err(|e| EngineError::io(descriptor_path.display().to_string(), e))?;
        let descriptor: TargetDescriptor = serde_json::from_str(&contents)?;

        let binary = require(&descriptor.binary, "binary")?.to_string();
        let binary_directory = PathBuf::from(require(&descriptor.binary_directory, "binary_directory")?);
        let runtime: Runtime = require(&descriptor.runtime, "runtime")?.parse()?;
        let target_events: Vec<Event> = descriptor
            .target_events
            .as_ref()
            .ok_or_else(|| EngineError::InvalidConfig("fuse.json is missing required field 'target_events'".into()))?
            .iter()
            .map(|e| normalize(e))
            .collect();
        let references_directory = PathBuf::from(require(&descriptor.references_directory, "references_directory")?);
        let tracefiles_directory = PathBuf::from(require(&descriptor.tracefiles_directory, "tracefiles_directory")?);
        let combinations_directory = PathBuf::from(require(&descriptor.combinations_directory, "combinations_directory")?);
        let papi_directory = PathBuf::from(require(&descriptor.papi_directory, "papi_directory")?);

        let reference_sets: Vec<Vec<Event>> =
            descriptor.reference_sets.iter().map(|set| set.iter().map(|e| normalize(e)).collect()).collect();

        let mut combined_profiles: HashMap<Strategy, Vec<u32>> = HashMap::new();
        for (name, mut indexes) in descriptor.combined_indexes {
            let strategy: Strategy = name.parse()?;
            indexes.sort_unstable();
            indexes.dedup();
            combined_profiles.insert(strategy, indexes);
        }

        let bc_sequence = parts_from_descriptor(descriptor.bc_sequence, false)?;
        let minimal_sequence = parts_from_descriptor(descriptor.minimal_sequence, true)?;

        for dir in [&references_directory, &tracefiles_directory, &combinations_directory] {
            let absolute = case_folder.join(dir);
            std::fs::create_dir_all(&absolute).map_err(|e| EngineError::io(absolute.display().to_string(), e))?;
        }

        let mut statistics = Statistics::new();
        let statistics_path = case_folder.join("statistics.csv");
        statistics.load(&statistics_path)?;

        Ok(Target {
            case_folder: case_folder.to_path_buf(),
            binary,
            binary_directory,
            runtime,
            target_events,
            args: descriptor.args,
            should_clear_cache: descriptor.should_clear_cache,
            references_directory,
            tracefiles_directory,
            combinations_directory,
            papi_directory,
            reference_sets,
            num_reference_repeats: descriptor.num_reference_repeats,
            bc_sequence,
            minimal_sequence,
            num_bc_sequence_repeats: descriptor.num_bc_sequence_repeats,
            num_minimal_sequence_repeats: descriptor.num_minimal_sequence_repeats,
            combined_profiles,
            statistics,
        })
    }

    /// Persists `fuse.json` (with every counter/registry/sequence update
    /// folded back in) and the `Statistics` accumulator, at
    /// `<case_folder>/statistics.csv`.
    pub fn save(&mut self) -> Result<(), EngineError> {
        let descriptor = TargetDescriptor {
            binary: Some(self.binary.clone()),
            binary_directory: Some(self.binary_directory.display().to_string()),
            runtime: Some(self.runtime.as_str().to_string()),
            target_events: Some(self.target_events.clone()),
            references_directory: Some(self.references_directory.display().to_string()),
            tracefiles_directory: Some(self.tracefiles_directory.display().to_string()),
            combinations_directory: Some(self.combinations_directory.display().to_string()),
            papi_directory: Some(self.papi_directory.display().to_string()),
            args: self.args.clone(),
            should_clear_cache: self.should_clear_cache,
            num_reference_repeats: self.num_reference_repeats,
            num_bc_sequence_repeats: self.num_bc_sequence_repeats,
            num_minimal_sequence_repeats: self.num_minimal_sequence_repeats,
            reference_sets: self.reference_sets.iter().map(|set| set.clone()).collect(),
            combined_indexes: self.combined_profiles.iter().map(|(s, idx)| (s.as_str().to_string(), idx.clone())).collect(),
            bc_sequence: parts_to_descriptor(&self.bc_sequence),
            minimal_sequence: parts_to_descriptor(&self.minimal_sequence),
        };

        let descriptor_path = self.case_folder.join("fuse.json");
        let json = serde_json::to_string_pretty(&descriptor)?;
        let mut file = File::create(&descriptor_path).map_err(|e| EngineError::io(descriptor_path.display().to_string(), e))?;
        file.write_all(json.as_bytes()).map_err(|e| EngineError::io(descriptor_path.display().to_string(), e))?;

        self.statistics.save(&self.case_folder.join("statistics.csv"))
    }

    #[must_use]
    pub fn get_target_binary(&self) -> PathBuf {
        self.binary_directory.join(&self.binary)
    }

    #[must_use]
    pub fn get_target_runtime(&self) -> Runtime {
        self.runtime
    }

    #[must_use]
    pub fn get_target_events(&self) -> &[Event] {
        &self.target_events
    }

    #[must_use]
    pub fn get_target_args(&self) -> &str {
        &self.args
    }

    #[must_use]
    pub fn get_should_clear_cache(&self) -> bool {
        self.should_clear_cache
    }

    #[must_use]
    pub fn get_references_directory(&self) -> PathBuf {
        self.case_folder.join(&self.references_directory)
    }

    #[must_use]
    pub fn get_tracefiles_directory(&self) -> PathBuf {
        self.case_folder.join(&self.tracefiles_directory)
    }

    #[must_use]
    pub fn get_combinations_directory(&self) -> PathBuf {
        self.case_folder.join(&self.combinations_directory)
    }

    #[must_use]
    pub fn get_papi_directory(&self) -> &Path {
        &self.papi_directory
    }

    #[must_use]
    pub fn get_reference_sets(&self) -> &[Vec<Event>] {
        &self.reference_sets
    }

    /// Returns the configured reference sets, or — if none were configured —
    /// falls back to a single reference set spanning every target event (see
    /// `DESIGN.md`'s Open Question on this point) and caches that fallback.
    pub fn get_or_generate_reference_sets(&mut self) -> &[Vec<Event>] {
        if self.reference_sets.is_empty() {
            log::warn!("target has no configured reference sets, falling back to one set spanning every target event");
            self.reference_sets = vec![self.target_events.clone()];
        }
        &self.reference_sets
    }

    /// The index of the first configured reference set that is a superset of
    /// `events`.
    pub fn get_reference_set_index_for_events(&self, events: &[Event]) -> Result<u32, EngineError> {
        self.reference_sets
            .iter()
            .position(|set| events.iter().all(|e| set.contains(e)))
            .map(|idx| idx as u32)
            .ok_or_else(|| EngineError::DataNotFound(format!("no reference set covers events {events:?}")))
    }

    /// Every unordered pair of target events subsumed by at least one
    /// configured reference set.
    #[must_use]
    pub fn get_reference_pairs(&self) -> Vec<(Event, Event)> {
        let mut pairs = Vec::new();
        for i in 0..self.target_events.len() {
            for j in (i + 1)..self.target_events.len() {
                let (a, b) = (&self.target_events[i], &self.target_events[j]);
                if self.reference_sets.iter().any(|set| set.contains(a) && set.contains(b)) {
                    pairs.push((a.clone(), b.clone()));
                }
            }
        }
        pairs
    }

    #[must_use]
    pub fn get_num_reference_repeats(&self) -> u32 {
        self.num_reference_repeats
    }

    pub fn increment_num_reference_repeats(&mut self) {
        self.num_reference_repeats += 1;
    }

    /// Path of the reference-distribution binary for `(reference_idx,
    /// repeat_idx)`, under the references directory.
    #[must_use]
    pub fn get_reference_filename_for(&self, reference_idx: u32, repeat_idx: u32) -> PathBuf {
        self.get_references_directory().join(format!("reference_distribution_{reference_idx}_{repeat_idx}.bin"))
    }

    #[must_use]
    pub fn get_calibration_file_path(&self) -> PathBuf {
        self.case_folder.join("calibration.csv")
    }

    #[must_use]
    pub fn get_sequence(&self, minimal: bool) -> &CombinationSequence {
        if minimal {
            &self.minimal_sequence
        } else {
            &self.bc_sequence
        }
    }

    /// Stores a freshly generated sequence. Minimal sequences (no
    /// `overlapping` events) replace the minimal slot; every other sequence
    /// is treated as the BC slot.
    pub fn set_sequence(&mut self, sequence: CombinationSequence) {
        if sequence.minimal {
            self.minimal_sequence = sequence;
        } else {
            self.bc_sequence = sequence;
        }
    }

    #[must_use]
    pub fn get_num_sequence_repeats(&self, minimal: bool) -> u32 {
        if minimal {
            self.num_minimal_sequence_repeats
        } else {
            self.num_bc_sequence_repeats
        }
    }

    pub fn increment_num_sequence_repeats(&mut self, minimal: bool) {
        if minimal {
            self.num_minimal_sequence_repeats += 1;
        } else {
            self.num_bc_sequence_repeats += 1;
        }
    }

    #[must_use]
    pub fn get_combination_output_path(&self, strategy: Strategy, repeat_idx: u32) -> PathBuf {
        self.get_combinations_directory().join(format!("{strategy}_{repeat_idx}.csv"))
    }

    #[must_use]
    pub fn combined_profile_exists(&self, strategy: Strategy, repeat_idx: u32) -> bool {
        self.combined_profiles.get(&strategy).is_some_and(|idx| idx.contains(&repeat_idx))
    }

    pub fn register_new_combined_profile(&mut self, strategy: Strategy, repeat_idx: u32) {
        let indexes = self.combined_profiles.entry(strategy).or_default();
        if !indexes.contains(&repeat_idx) {
            indexes.push(repeat_idx);
            indexes.sort_unstable();
        }
    }

    #[must_use]
    pub fn get_num_combined_profiles(&self, strategy: Strategy) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        self.combined_profiles.get(&strategy).map_or(0, |idx| idx.len() as u32)
    }

    #[must_use]
    pub fn get_combined_profile_indexes(&self, strategy: Strategy) -> Vec<u32> {
        self.combined_profiles.get(&strategy).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn statistics_mut(&mut self) -> &mut Statistics {
        &mut self.statistics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_minimal_descriptor(dir: &Path) {
        let json = serde_json::json!({
            "binary": "bench",
            "binary_directory": "/opt/bench",
            "runtime": "openmp",
            "target_events": ["Cycles", "Instructions"],
            "references_directory": "references",
            "tracefiles_directory": "tracefiles",
            "combinations_directory": "combinations",
            "papi_directory": "/opt/papi",
        });
        std::fs::write(dir.join("fuse.json"), json.to_string()).unwrap();
    }

    #[test]
    fn load_lowercases_target_events_and_scaffolds_directories() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_descriptor(dir.path());

        let target = Target::load(dir.path()).unwrap();
        assert_eq!(target.get_target_events(), &["cycles".to_string(), "instructions".to_string()]);
        assert!(target.get_tracefiles_directory().is_dir());
        assert!(target.get_references_directory().is_dir());
        assert!(target.get_combinations_directory().is_dir());
    }

    #[test]
    fn load_fails_on_missing_required_field() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({"binary": "bench"});
        std::fs::write(dir.path().join("fuse.json"), json.to_string()).unwrap();
        let err = Target::load(dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn load_fails_on_invalid_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({
            "binary": "bench", "binary_directory": "/opt/bench", "runtime": "weird",
            "target_events": ["cycles"], "references_directory": "r",
            "tracefiles_directory": "t", "combinations_directory": "c", "papi_directory": "/opt/papi",
        });
        std::fs::write(dir.path().join("fuse.json"), json.to_string()).unwrap();
        assert!(Target::load(dir.path()).is_err());
    }

    #[test]
    fn save_then_load_round_trips_counters_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_descriptor(dir.path());

        let mut target = Target::load(dir.path()).unwrap();
        target.increment_num_reference_repeats();
        target.increment_num_sequence_repeats(false);
        target.register_new_combined_profile(Strategy::Bc, 0);
        target.register_new_combined_profile(Strategy::Bc, 1);
        target.save().unwrap();

        let reloaded = Target::load(dir.path()).unwrap();
        assert_eq!(reloaded.get_num_reference_repeats(), 1);
        assert_eq!(reloaded.get_num_sequence_repeats(false), 1);
        assert_eq!(reloaded.get_combined_profile_indexes(Strategy::Bc), vec![0, 1]);
    }

    #[test]
    fn get_or_generate_reference_sets_falls_back_to_every_target_event() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_descriptor(dir.path());
        let mut target = Target::load(dir.path()).unwrap();
        let sets = target.get_or_generate_reference_sets();
        assert_eq!(sets, &[vec!["cycles".to_string(), "instructions".to_string()]]);
    }

    #[test]
    fn reference_pair_requires_a_subsuming_reference_set() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({
            "binary": "bench", "binary_directory": "/opt/bench", "runtime": "openmp",
            "target_events": ["a", "b", "c"],
            "references_directory": "r", "tracefiles_directory": "t",
            "combinations_directory": "c", "papi_directory": "/opt/papi",
            "reference_sets": [["a", "b"]],
        });
        std::fs::write(dir.path().join("fuse.json"), json.to_string()).unwrap();
        let target = Target::load(dir.path()).unwrap();
        let pairs = target.get_reference_pairs();
        assert_eq!(pairs, vec![("a".to_string(), "b".to_string())]);
    }

    #[test]
    fn invalid_bc_sequence_is_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({
            "binary": "bench", "binary_directory": "/opt/bench", "runtime": "openmp",
            "target_events": ["a", "b"], "references_directory": "r",
            "tracefiles_directory": "t", "combinations_directory": "c", "papi_directory": "/opt/papi",
            "bc_sequence": [{"overlapping": ["a"], "unique": ["b"]}],
        });
        std::fs::write(dir.path().join("fuse.json"), json.to_string()).unwrap();
        assert!(Target::load(dir.path()).is_err());
    }
}
