//! CLI argument definitions
//!
//! Mirrors the teacher's `#[derive(Parser)]` style. Main actions
//! (`--execute-references`/`--execute-sequence`/`--combine-sequence`/
//! `--analyse-accuracy`/`--run-calibration`) are modeled as plain flags rather
//! than a `clap` subcommand enum; [`Args::resolve_action`] enforces
//! "exactly one selected" the way the teacher's `conflicts_with_all` enforced
//! mutual exclusion between replay and live-profiling flags.

use std::path::PathBuf;

use clap::Parser;

use crate::domain::errors::EngineError;
use crate::domain::types::Strategy;

#[derive(Parser, Debug)]
#[command(
    name = "fusehpm",
    about = "Fuses partial hardware-performance-counter profiles into a synthetic full-event profile with a calibrated accuracy metric.",
    after_help = "\
EXAMPLES:
    fusehpm --case-folder ./bench --execute-references 5
    fusehpm --case-folder ./bench --execute-sequence 3 --minimal
    fusehpm --case-folder ./bench --combine-sequence --strategies bc,lgl
    fusehpm --case-folder ./bench --run-calibration
    fusehpm --case-folder ./bench --analyse-accuracy"
)]
pub struct Args {
    /// Case folder containing `fuse.json`. Required for every main action;
    /// not needed by the `--dump-*` utilities.
    #[arg(long, value_name = "DIR")]
    pub case_folder: Option<PathBuf>,

    /// Execute N further repeats of the target's combination sequence.
    #[arg(long, value_name = "N")]
    pub execute_sequence: Option<u32>,

    /// Combine already-executed sequence repeats into fused profiles.
    #[arg(long)]
    pub combine_sequence: bool,

    /// Compute calibrated accuracy for the target's combined profiles.
    #[arg(long)]
    pub analyse_accuracy: bool,

    /// Execute N further reference-set repeats.
    #[arg(long, value_name = "N")]
    pub execute_references: Option<u32>,

    /// (Re)compute the calibration table from the target's reference repeats.
    #[arg(long)]
    pub run_calibration: bool,

    /// Restrict an action to a subset of the closed strategy set.
    #[arg(long, value_delimiter = ',')]
    pub strategies: Vec<String>,

    /// Use the minimal (no-overlap) sequence instead of the BC sequence.
    #[arg(long)]
    pub minimal: bool,

    /// Raise log verbosity by one level.
    #[arg(long)]
    pub debug: bool,

    /// Dump a tracefile's instances to CSV.
    #[arg(long)]
    pub dump_instances: bool,

    /// Dump a tracefile's instance-dependency matrix.
    #[arg(long)]
    pub dump_dependency_matrix: bool,

    /// Tracefile for `--dump-instances`/`--dump-dependency-matrix`.
    #[arg(long, value_name = "FILE")]
    pub tracefile: Option<PathBuf>,

    /// Name of the benchmark being inspected, attached to the dumped profile.
    #[arg(long)]
    pub benchmark: Option<String>,

    /// Output file for dump utilities and analysis summaries.
    #[arg(long, value_name = "FILE")]
    pub output_file: Option<PathBuf>,
}

/// The exactly-one main action selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ExecuteReferences(u32),
    ExecuteSequence(u32),
    CombineSequence,
    AnalyseAccuracy,
    RunCalibration,
}

impl Args {
    /// Resolves the single selected main action, failing if zero or more
    /// than one was given.
    pub fn resolve_action(&self) -> Result<Action, EngineError> {
        let mut actions = Vec::new();
        if let Some(n) = self.execute_references {
            actions.push(Action::ExecuteReferences(n));
        }
        if let Some(n) = self.execute_sequence {
            actions.push(Action::ExecuteSequence(n));
        }
        if self.combine_sequence {
            actions.push(Action::CombineSequence);
        }
        if self.analyse_accuracy {
            actions.push(Action::AnalyseAccuracy);
        }
        if self.run_calibration {
            actions.push(Action::RunCalibration);
        }

        match actions.len() {
            0 => Err(EngineError::InvalidConfig(
                "no main action selected: choose one of --execute-references, --execute-sequence, \
                 --combine-sequence, --analyse-accuracy, --run-calibration"
                    .into(),
            )),
            1 => Ok(actions[0]),
            _ => Err(EngineError::InvalidConfig("only one main action may be selected at a time".into())),
        }
    }

    /// Resolves `--strategies` into the closed strategy set, applying
    /// `--minimal`; defaults to every non-HEM strategy when unset.
    pub fn resolve_strategies(&self) -> Result<Vec<Strategy>, EngineError> {
        if self.strategies.is_empty() {
            return Ok(vec![Strategy::Random, Strategy::RandomTt, Strategy::Ctc, Strategy::Lgl, Strategy::Bc]);
        }
        self.strategies.iter().map(|name| Strategy::from_name_and_minimal(name, self.minimal)).collect()
    }

    /// Case folder for a main action; `InvalidConfig` if absent.
    pub fn require_case_folder(&self) -> Result<&std::path::Path, EngineError> {
        self.case_folder
            .as_deref()
            .ok_or_else(|| EngineError::InvalidConfig("--case-folder is required for this action".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_args() -> Args {
        Args {
            case_folder: None,
            execute_sequence: None,
            combine_sequence: false,
            analyse_accuracy: false,
            execute_references: None,
            run_calibration: false,
            strategies: vec![],
            minimal: false,
            debug: false,
            dump_instances: false,
            dump_dependency_matrix: false,
            tracefile: None,
            benchmark: None,
            output_file: None,
        }
    }

    #[test]
    fn resolve_action_rejects_when_none_selected() {
        assert!(blank_args().resolve_action().is_err());
    }

    #[test]
    fn resolve_action_rejects_when_multiple_selected() {
        let mut args = blank_args();
        args.combine_sequence = true;
        args.analyse_accuracy = true;
        assert!(args.resolve_action().is_err());
        args.analyse_accuracy = false;
        assert_eq!(args.resolve_action().unwrap(), Action::CombineSequence);
    }

    #[test]
    fn resolve_action_accepts_single_selection() {
        let mut args = blank_args();
        args.execute_references = Some(5);
        assert_eq!(args.resolve_action().unwrap(), Action::ExecuteReferences(5));
    }

    #[test]
    fn resolve_strategies_defaults_to_full_closed_set_minus_hem() {
        let args = blank_args();
        let strategies = args.resolve_strategies().unwrap();
        assert_eq!(strategies.len(), 5);
        assert!(!strategies.contains(&Strategy::Hem));
    }

    #[test]
    fn resolve_strategies_applies_minimal_flag() {
        let mut args = blank_args();
        args.strategies = vec!["ctc".to_string()];
        args.minimal = true;
        assert_eq!(args.resolve_strategies().unwrap(), vec![Strategy::CtcMinimal]);
    }

    #[test]
    fn require_case_folder_errors_when_absent() {
        assert!(blank_args().require_case_folder().is_err());
    }
}
