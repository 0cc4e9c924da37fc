//! Instance-matching and fusion strategies
//!
//! Combines two or more [`ExecutionProfile`]s, each observing a different
//! subset of events, into one synthetic profile covering their union of
//! events. Random/random_tt/ctc/lgl matching lives in [`matching`]; bounded
//! clustering lives in [`bc`]. Grounded on `combination.cpp`'s
//! `generate_combined_profile` dispatch.

mod bc;
mod matching;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg64Mcg;

use crate::domain::errors::EngineError;
use crate::domain::types::{Event, Strategy};
use crate::profile::{ExecutionProfile, Instance};
use crate::statistics::Statistics;

/// Combines `profiles` (at least two) via `strategy`.
///
/// `overlapping_per_profile[i]` names the events profile `i` shares with the
/// instances it is matched against; index 0 is unused and may be empty. Only
/// [`Strategy::Bc`] consults `statistics` (for per-dimension bounds); other
/// strategies ignore it.
pub fn combine_profiles_via_strategy(
    profiles: &[ExecutionProfile],
    strategy: Strategy,
    overlapping_per_profile: &[Vec<Event>],
    statistics: Option<&Statistics>,
    seed: Option<u64>,
) -> Result<ExecutionProfile, EngineError> {
    if profiles.len() < 2 {
        return Err(EngineError::PreconditionViolated(format!(
            "combining profiles requires at least 2 profiles, found {}",
            profiles.len()
        )));
    }
    if strategy == Strategy::Hem {
        return Err(EngineError::PreconditionViolated(
            "hem is a repeated-execution strategy, not a post-hoc combination strategy".into(),
        ));
    }

    let combined_instances = match strategy {
        Strategy::Random | Strategy::RandomMinimal => {
            let mut rng = make_rng(seed);
            generate_combined_instances_unordered(profiles, false, |lists| matching::extract_matched_instances_random(lists, rng.as_mut()))?
        }
        Strategy::Lgl | Strategy::LglMinimal => {
            generate_combined_instances_unordered(profiles, false, matching::extract_matched_instances_by_label)?
        }
        Strategy::RandomTt | Strategy::RandomTtMinimal => {
            generate_combined_instances_unordered(profiles, true, matching::extract_matched_instances_chronological)?
        }
        Strategy::Ctc | Strategy::CtcMinimal => {
            generate_combined_instances_unordered(profiles, true, matching::extract_matched_instances_by_label)?
        }
        Strategy::Bc => {
            let statistics = statistics.ok_or_else(|| {
                EngineError::PreconditionViolated("bc combination strategy requires precomputed statistics".into())
            })?;
            bc::generate_combined_instances_bc(profiles, overlapping_per_profile, statistics)?
        }
        Strategy::Hem => unreachable!("rejected above"),
    };

    build_combined_profile(profiles, combined_instances)
}

/// Runs `matcher` once per symbol (if `per_symbol`) or once across every
/// instance regardless of symbol, gathering each profile's instance list
/// (excluding `runtime`) first.
fn generate_combined_instances_unordered(
    profiles: &[ExecutionProfile],
    per_symbol: bool,
    mut matcher: impl FnMut(Vec<Vec<Instance>>) -> Vec<Vec<Instance>>,
) -> Result<Vec<Instance>, EngineError> {
    let symbol_groups: Vec<Vec<String>> = if per_symbol {
        profiles[0].get_unique_symbols(false).into_iter().map(|s| vec![s]).collect()
    } else {
        vec![Vec::new()]
    };

    let mut combined = Vec::new();
    for symbols in symbol_groups {
        let lists: Vec<Vec<Instance>> = profiles
            .iter()
            .map(|profile| profile.get_instances(false, &symbols).into_iter().map(|id| profile.instance(id).clone()).collect())
            .collect();

        let matched = matcher(lists);
        combined.extend(matched.iter().map(|group| combine_instances(group)));
    }

    Ok(combined)
}

/// Merges one matched group of instances (one per input profile) into a
/// single instance: event values are unioned, with the first profile's value
/// winning on overlap, and timing/label/symbol/cpu are inherited from the
/// first profile's instance.
pub(crate) fn combine_instances(group: &[Instance]) -> Instance {
    let mut merged = group[0].clone();
    for other in &group[1..] {
        for (event, value) in &other.event_values {
            merged.event_values.entry(event.clone()).or_insert(*value);
        }
    }
    merged
}

fn build_combined_profile(profiles: &[ExecutionProfile], combined_instances: Vec<Instance>) -> Result<ExecutionProfile, EngineError> {
    let mut out = ExecutionProfile::new(None, None, None);

    for id in profiles[0].get_instances(true, &[]) {
        let instance = profiles[0].instance(id);
        if instance.symbol == crate::domain::types::RUNTIME_SYMBOL {
            out.add_instance(instance.clone());
        }
    }

    for instance in combined_instances {
        for event in instance.event_values.keys() {
            out.add_event(event.clone());
        }
        out.add_instance(instance);
    }

    Ok(out)
}

fn make_rng(seed: Option<u64>) -> Box<dyn RngCore> {
    match seed {
        Some(seed) => Box::new(Pcg64Mcg::seed_from_u64(seed)),
        None => Box::new(StdRng::from_entropy()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{CpuId, Label};

    fn profile_with(symbol: &str, events: &[(&str, i64)]) -> ExecutionProfile {
        let mut profile = ExecutionProfile::new(None, None, None);
        let mut instance = Instance::new(symbol.to_string(), Label(vec![0]), CpuId(0), 0, 1, false).unwrap();
        for (event, value) in events {
            instance.set_event_value((*event).to_string(), *value);
        }
        profile.add_event(events[0].0.to_string());
        profile.add_instance(instance);
        profile
    }

    #[test]
    fn fewer_than_two_profiles_is_rejected() {
        let profiles = vec![profile_with("foo", &[("a", 1)])];
        let err = combine_profiles_via_strategy(&profiles, Strategy::Lgl, &[vec![], vec![]], None, None).unwrap_err();
        assert!(matches!(err, EngineError::PreconditionViolated(_)));
    }

    #[test]
    fn hem_is_rejected_as_a_combination_strategy() {
        let profiles = vec![profile_with("foo", &[("a", 1)]), profile_with("foo", &[("b", 2)])];
        let err = combine_profiles_via_strategy(&profiles, Strategy::Hem, &[vec![], vec![]], None, None).unwrap_err();
        assert!(matches!(err, EngineError::PreconditionViolated(_)));
    }

    #[test]
    fn lgl_combination_merges_events_from_both_profiles() {
        let profiles = vec![profile_with("foo", &[("a", 1)]), profile_with("foo", &[("b", 2)])];
        let combined = combine_profiles_via_strategy(&profiles, Strategy::Lgl, &[vec![], vec![]], None, None).unwrap();
        let ids = combined.get_instances(false, &[]);
        assert_eq!(ids.len(), 1);
        let instance = combined.instance(ids[0]);
        assert_eq!(instance.get_event_value(&"a".to_string()), Some(1));
        assert_eq!(instance.get_event_value(&"b".to_string()), Some(2));
    }

    #[test]
    fn combine_instances_prefers_first_profile_on_event_overlap() {
        let mut a = Instance::new("foo".to_string(), Label(vec![0]), CpuId(0), 0, 1, false).unwrap();
        a.set_event_value("shared".to_string(), 1);
        let mut b = Instance::new("foo".to_string(), Label(vec![0]), CpuId(0), 0, 1, false).unwrap();
        b.set_event_value("shared".to_string(), 2);
        let merged = combine_instances(&[a, b]);
        assert_eq!(merged.get_event_value(&"shared".to_string()), Some(1));
    }
}
