//! Top-level orchestration
//!
//! Wires together statistics, profiling, combination and analysis into the
//! operations a CLI invocation performs on one [`Target`]. Grounded on
//! `fuse.cpp`'s free functions of the same names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analysis::{self, CalibrationTable};
use crate::combination::combine_profiles_via_strategy;
use crate::domain::errors::EngineError;
use crate::domain::types::{AccuracyMetric, Event, Runtime, Strategy, Symbol, ALL_SYMBOLS};
use crate::external::{Profiler, TraceParser};
use crate::profile::ExecutionProfile;
use crate::reference_cache::{self, LoadMode, ReferenceCache};
use crate::statistics::Statistics;
use crate::target::Target;

/// Runs `profiler.execute` up to `max_attempts` times with a 1-second
/// back-off between failures, matching the spec's retry-then-fail contract
/// for the profiler external call.
#[allow(clippy::too_many_arguments)]
fn execute_with_retries(
    profiler: &dyn Profiler,
    runtime: Runtime,
    binary: &Path,
    args: &str,
    tracefile: &Path,
    event_set: &[Event],
    clear_cache: bool,
    multiplex: bool,
    max_attempts: u32,
) -> Result<(), EngineError> {
    let attempts = max_attempts.max(1);
    let mut last_reason = String::new();

    for attempt in 1..=attempts {
        match profiler.execute(runtime, binary, args, tracefile, event_set, clear_cache, multiplex) {
            Ok(()) => return Ok(()),
            Err(err) => {
                log::warn!("profiler execution attempt {attempt}/{attempts} failed: {err}");
                last_reason = err.to_string();
                if attempt < attempts {
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }

    Err(EngineError::ExecutionFailure { attempts, reason: last_reason })
}

/// Adds every instance's event values to `statistics`, for every event the
/// profile declares. Grounded on `add_profile_event_values_to_statistics`.
pub fn add_profile_event_values_to_statistics(profile: &ExecutionProfile, statistics: &mut Statistics) {
    let events = profile.get_unique_events().to_vec();
    for id in profile.get_instances(true, &[]) {
        let instance = profile.instance(id);
        for event in &events {
            if let Some(value) = instance.get_event_value(event) {
                statistics.add(event, value, &instance.symbol);
            }
        }
    }
}

fn reference_tracefile_path(target: &Target, instance_idx: u32, reference_idx: usize) -> PathBuf {
    target.get_tracefiles_directory().join(format!("reference_profile_{instance_idx}-{reference_idx}.ost"))
}

/// Runs `number_of_repeats` further repeats of every registered reference
/// set, recording each repeat's distribution to the reference cache and
/// folding its event values into the target's statistics.
pub fn execute_references(
    target: &mut Target,
    profiler: &dyn Profiler,
    parser: &dyn TraceParser,
    number_of_repeats: u32,
    max_execution_attempts: u32,
) -> Result<(), EngineError> {
    let reference_sets = target.get_or_generate_reference_sets().to_vec();
    if reference_sets.is_empty() {
        return Err(EngineError::PreconditionViolated("target has no reference sets to execute".into()));
    }

    let current_idx = target.get_num_reference_repeats();

    for instance_idx in current_idx..(current_idx + number_of_repeats) {
        for (reference_idx, reference_set) in reference_sets.iter().enumerate() {
            let tracefile = reference_tracefile_path(target, instance_idx, reference_idx);
            execute_with_retries(
                profiler,
                target.get_target_runtime(),
                &target.get_target_binary(),
                target.get_target_args(),
                &tracefile,
                reference_set,
                target.get_should_clear_cache(),
                false,
                max_execution_attempts,
            )?;

            let profile = parser.parse_trace(&tracefile, target.get_target_runtime(), false)?;
            add_profile_event_values_to_statistics(&profile, target.statistics_mut());

            let mut values_per_symbol: HashMap<Symbol, Vec<Vec<i64>>> = HashMap::new();
            for symbol in profile.get_unique_symbols(false) {
                let values = profile.get_value_distribution(reference_set, false, std::slice::from_ref(&symbol))?;
                values_per_symbol.insert(symbol, values);
            }

            let path = target.get_reference_filename_for(reference_idx as u32, instance_idx);
            reference_cache::save(
                &path,
                &reference_cache::ReferenceDistribution { events: reference_set.clone(), values_per_symbol },
            )?;
        }
        target.increment_num_reference_repeats();
    }

    target.save()
}

/// Runs `number_of_repeats` further repeats of the target's BC or minimal
/// sequence, returning each repeat's per-part profiles.
pub fn execute_sequence_repeats(
    target: &mut Target,
    profiler: &dyn Profiler,
    parser: &dyn TraceParser,
    number_of_repeats: u32,
    minimal: bool,
    max_execution_attempts: u32,
) -> Result<Vec<Vec<ExecutionProfile>>, EngineError> {
    let sequence = target.get_sequence(minimal).clone();
    if sequence.parts.is_empty() {
        return Err(EngineError::PreconditionViolated(format!(
            "no {} sequence has been defined in the target, cannot execute its profiles",
            if minimal { "minimal" } else { "non-minimal" }
        )));
    }

    let current_idx = target.get_num_sequence_repeats(minimal);
    let mut repeats = Vec::new();

    for instance_idx in current_idx..(current_idx + number_of_repeats) {
        let mut part_profiles = Vec::new();

        for part in &sequence.parts {
            let prefix = if minimal { "minimal" } else { "non_minimal" };
            let tracefile =
                target.get_tracefiles_directory().join(format!("{prefix}_sequence_profile_{instance_idx}-{}.ost", part.part_index));

            let mut profiled_events: Vec<Event> = part.unique.clone();
            profiled_events.extend(part.overlapping.iter().cloned());

            execute_with_retries(
                profiler,
                target.get_target_runtime(),
                &target.get_target_binary(),
                target.get_target_args(),
                &tracefile,
                &profiled_events,
                target.get_should_clear_cache(),
                false,
                max_execution_attempts,
            )?;

            let profile = parser.parse_trace(&tracefile, target.get_target_runtime(), false)?;
            add_profile_event_values_to_statistics(&profile, target.statistics_mut());
            part_profiles.push(profile);
        }

        target.increment_num_sequence_repeats(minimal);
        repeats.push(part_profiles);
    }

    target.save()?;
    Ok(repeats)
}

/// Runs `number_of_repeats` further hardware-multiplexed (HEM) repeats. HEM
/// profiles are produced directly by the profiler, not by the combination
/// engine.
pub fn execute_hem_repeats(
    target: &mut Target,
    profiler: &dyn Profiler,
    parser: &dyn TraceParser,
    number_of_repeats: u32,
    max_execution_attempts: u32,
) -> Result<Vec<ExecutionProfile>, EngineError> {
    let current_idx = target.get_num_combined_profiles(Strategy::Hem);
    let mut profiles = Vec::new();

    for instance_idx in current_idx..(current_idx + number_of_repeats) {
        let tracefile = target.get_tracefiles_directory().join(format!("hem_profile_{instance_idx}.ost"));
        let events = target.get_target_events().to_vec();

        execute_with_retries(
            profiler,
            target.get_target_runtime(),
            &target.get_target_binary(),
            target.get_target_args(),
            &tracefile,
            &events,
            target.get_should_clear_cache(),
            true,
            max_execution_attempts,
        )?;

        let profile = parser.parse_trace(&tracefile, target.get_target_runtime(), false)?;
        target.register_new_combined_profile(Strategy::Hem, instance_idx);
        profiles.push(profile);
    }

    target.save()?;
    Ok(profiles)
}

/// Combines each repeat's already-loaded sequence profiles (as returned by
/// [`execute_sequence_repeats`], or reloaded by the caller) via every
/// requested strategy, skipping any `(strategy, repeat)` pair already
/// combined.
pub fn combine_sequence_repeats(
    target: &mut Target,
    strategies: &[Strategy],
    repeats: &[(u32, Vec<ExecutionProfile>)],
    minimal: bool,
) -> Result<Vec<((Strategy, u32), ExecutionProfile)>, EngineError> {
    let sequence = target.get_sequence(minimal).clone();
    let mut combined = Vec::new();

    for (repeat_idx, profiles) in repeats {
        for &strategy in strategies {
            if strategy == Strategy::Hem {
                log::info!("cannot combine sequence profiles via hem, ignoring this strategy");
                continue;
            }
            if target.combined_profile_exists(strategy, *repeat_idx) {
                log::info!("repeat {repeat_idx} already combined via {strategy}, skipping");
                continue;
            }

            let overlapping_per_profile: Vec<Vec<Event>> = if strategy == Strategy::Bc {
                sequence.parts.iter().map(|p| p.overlapping.clone()).collect()
            } else {
                vec![Vec::new(); profiles.len()]
            };

            let statistics_ref = if strategy == Strategy::Bc { Some(target.statistics()) } else { None };
            let combined_profile = combine_profiles_via_strategy(profiles, strategy, &overlapping_per_profile, statistics_ref, None)?;

            let output_path = target.get_combination_output_path(strategy, *repeat_idx);
            combined_profile.print_to_file(&output_path)?;

            target.register_new_combined_profile(strategy, *repeat_idx);
            combined.push(((strategy, *repeat_idx), combined_profile));
        }
        target.save()?;
    }

    Ok(combined)
}

/// Builds a [`ReferenceCache`] registering every `(reference_idx, repeat_idx)`
/// file the target has already recorded, in `mode`. Grounded on
/// `target.cpp`'s cache population at the start of an accuracy run.
pub fn build_reference_cache(target: &Target, mode: LoadMode) -> ReferenceCache {
    let mut cache = ReferenceCache::new(mode);
    let num_repeats = target.get_num_reference_repeats();
    for reference_idx in 0..target.get_reference_sets().len() as u32 {
        for repeat_idx in 0..num_repeats {
            let path = target.get_reference_filename_for(reference_idx, repeat_idx);
            if path.exists() {
                // Registration only fails on read errors in Eager mode; a
                // once-written reference file is trusted here.
                let _ = cache.register(reference_idx, repeat_idx, path);
            }
        }
    }
    cache
}

/// Computes the calibrated accuracy of one combined profile against every
/// reference pair, returning the per-pair calibrated TMDs plus their
/// weighted-geometric-mean aggregate (epd).
pub fn analyse_sequence_combinations(
    target: &Target,
    combined_profile: &ExecutionProfile,
    reference_cache: &mut ReferenceCache,
    calibration: &CalibrationTable,
    metric: AccuracyMetric,
    calculate_per_workfunction: bool,
    tmd_bin_count: u32,
) -> Result<(Vec<f64>, f64), EngineError> {
    if !matches!(metric, AccuracyMetric::Epd | AccuracyMetric::EpdTt) {
        return Err(EngineError::PreconditionViolated(format!("accuracy metric '{metric}' is not yet supported by this analyzer")));
    }

    let reference_pairs = target.get_reference_pairs();
    let num_reference_repeats = target.get_num_reference_repeats();

    let mut symbols = vec![ALL_SYMBOLS.to_string()];
    if calculate_per_workfunction {
        symbols.extend(target.statistics().get_unique_symbols(false));
    }

    let mut per_pair_tmds = Vec::with_capacity(reference_pairs.len());

    for (pair_idx, (a, b)) in reference_pairs.iter().enumerate() {
        let events = vec![a.clone(), b.clone()];
        let reference_idx = target.get_reference_set_index_for_events(&events)?;

        let mut per_symbol_raw_tmds: HashMap<Symbol, Vec<f64>> = HashMap::new();
        for symbol in &symbols {
            let constrained = if symbol == ALL_SYMBOLS { Vec::new() } else { vec![symbol.clone()] };
            let combined_values = combined_profile.get_value_distribution(&events, false, &constrained)?;

            let mut raw_tmds = Vec::new();
            for repeat_idx in 0..num_reference_repeats {
                let reference_values = reference_cache.get_or_load_reference_distribution(&events, reference_idx, repeat_idx, &constrained)?;
                if reference_values.is_empty() || combined_values.is_empty() {
                    continue;
                }
                let bounds = vec![
                    target.statistics().bounds(a, symbol)?,
                    target.statistics().bounds(b, symbol)?,
                ];
                raw_tmds.push(analysis::uncalibrated_tmd(&combined_values, &reference_values, &bounds, tmd_bin_count)?);
            }
            if !raw_tmds.is_empty() {
                per_symbol_raw_tmds.insert(symbol.clone(), raw_tmds);
            }
        }

        let calibrated = analysis::calibrated_tmd_for_pair(&per_symbol_raw_tmds, calibration, reference_idx, &events)?;
        per_pair_tmds.push(calibrated);
        log::debug!("calibrated tmd for reference pair {pair_idx} ({a}, {b}): {calibrated}");
    }

    let weights = vec![1.0; per_pair_tmds.len()];
    let epd = crate::statistics::weighted_geometric_mean(&per_pair_tmds, &weights);
    Ok((per_pair_tmds, epd))
}

/// Computes (or skips, if already present) the self-distance calibration
/// entry for every reference pair, persisting the result.
pub fn calculate_calibration_tmds(
    target: &Target,
    reference_cache: &mut ReferenceCache,
    calibration: &mut CalibrationTable,
    calculate_per_workfunction: bool,
    tmd_bin_count: u32,
) -> Result<(), EngineError> {
    let reference_pairs = target.get_reference_pairs();
    let num_reference_repeats = target.get_num_reference_repeats();
    if num_reference_repeats < 2 {
        return Err(EngineError::PreconditionViolated("calibration requires at least 2 reference repeats".into()));
    }

    let mut symbols = vec![ALL_SYMBOLS.to_string()];
    if calculate_per_workfunction {
        symbols.extend(target.statistics().get_unique_symbols(false));
    }

    for (pair_idx, (a, b)) in reference_pairs.iter().enumerate() {
        let events = vec![a.clone(), b.clone()];
        #[allow(clippy::cast_possible_truncation)]
        let pair_idx = pair_idx as u32;

        if calibration.contains(&ALL_SYMBOLS.to_string(), pair_idx, &events) {
            log::debug!("already calibrated reference pair {pair_idx} ({a}, {b}), skipping");
            continue;
        }

        let reference_idx = target.get_reference_set_index_for_events(&events)?;

        for symbol in &symbols {
            let constrained = if symbol == ALL_SYMBOLS { Vec::new() } else { vec![symbol.clone()] };

            let mut repeats = Vec::with_capacity(num_reference_repeats as usize);
            for repeat_idx in 0..num_reference_repeats {
                repeats.push(reference_cache.get_or_load_reference_distribution(&events, reference_idx, repeat_idx, &constrained)?);
            }
            repeats.retain(|r| !r.is_empty());
            if repeats.len() < 2 {
                continue;
            }

            let bounds = vec![target.statistics().bounds(a, symbol)?, target.statistics().bounds(b, symbol)?];
            let entry = analysis::compute_calibration_entry(&repeats, &bounds, tmd_bin_count)?;
            calibration.insert(symbol.clone(), pair_idx, &events, entry);
        }
    }

    Ok(())
}

/// Loads (or starts) the target's calibration table, folds in any
/// newly-calibratable reference pairs, and persists the result. Wraps
/// [`calculate_calibration_tmds`] the way a `--run-calibration` CLI
/// invocation drives it end to end.
pub fn run_calibration(
    target: &Target,
    calculate_per_workfunction: bool,
    load_mode: reference_cache::LoadMode,
    tmd_bin_count: u32,
) -> Result<CalibrationTable, EngineError> {
    let mut cache = build_reference_cache(target, load_mode);
    let mut calibration = CalibrationTable::new();
    let calibration_path = target.get_calibration_file_path();
    if calibration_path.exists() {
        calibration.load(&calibration_path)?;
    }
    calculate_calibration_tmds(target, &mut cache, &mut calibration, calculate_per_workfunction, tmd_bin_count)?;
    calibration.save(&calibration_path)?;
    Ok(calibration)
}

/// Reloads every combined profile the target has recorded for `strategies`
/// and computes its calibrated accuracy, the way a `--analyse-accuracy` CLI
/// invocation drives it end to end.
#[allow(clippy::too_many_arguments)]
pub fn run_accuracy_analysis(
    target: &Target,
    strategies: &[Strategy],
    reference_cache: &mut ReferenceCache,
    calibration: &CalibrationTable,
    metric: AccuracyMetric,
    calculate_per_workfunction: bool,
    tmd_bin_count: u32,
) -> Result<Vec<(Strategy, u32, f64)>, EngineError> {
    let mut results = Vec::new();
    for &strategy in strategies {
        if strategy == Strategy::Hem {
            continue;
        }
        for repeat_idx in target.get_combined_profile_indexes(strategy) {
            let path = target.get_combination_output_path(strategy, repeat_idx);
            let profile = ExecutionProfile::load_from_file(&path, target.get_target_events())?;
            let (_, epd) =
                analyse_sequence_combinations(target, &profile, reference_cache, calibration, metric, calculate_per_workfunction, tmd_bin_count)?;
            results.push((strategy, repeat_idx, epd));
        }
    }
    Ok(results)
}

/// Delegates to [`crate::sequence::generate_bc_sequence`] using mutual
/// information derived from the target's already-loaded reference
/// distributions, and stores the result on the target.
pub fn generate_bc_sequence(
    target: &mut Target,
    pairwise_mi: &HashMap<(Event, Event), f64>,
    num_pmc: usize,
    max_linking_events: usize,
    is_compatible: &dyn Fn(&[Event]) -> bool,
    oracle: &(dyn crate::sequence::AccuracyOracle + Sync),
) -> Result<(), EngineError> {
    let sequence = crate::sequence::generate_bc_sequence(target.get_target_events(), pairwise_mi, num_pmc, max_linking_events, is_compatible, oracle)?;
    target.set_sequence(sequence);
    Ok(())
}
