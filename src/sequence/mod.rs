//! Combination-sequence generation (branch-and-bound)
//!
//! Builds a BC-style [`CombinationSequence`] for target event sets larger
//! than the hardware's physical counter count, by greedily rooting on the
//! least-informative reference pair and then branch-and-bound expanding
//! candidate linking/unique event groupings, scored by a caller-supplied
//! accuracy oracle rather than a live profiler run (out of scope here, see
//! `external`). Grounded on `sequence_generator.h`/`.cpp`'s `Node`,
//! `get_tree_root`, `get_child_nodes` and `prune_priority_list`.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::errors::EngineError;
use crate::domain::types::Event;

/// One part of a combination sequence: the events it links against earlier
/// parts, and the events it newly introduces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequencePart {
    pub part_index: u32,
    #[serde(default)]
    pub overlapping: Vec<Event>,
    pub unique: Vec<Event>,
}

/// An ordered list of [`SequencePart`]s, either the BC variant (parts link
/// via `overlapping` events) or the minimal variant (no overlap at all).
#[derive(Debug, Clone, Default)]
pub struct CombinationSequence {
    pub parts: Vec<SequencePart>,
    pub minimal: bool,
}

impl CombinationSequence {
    /// Checks the invariants from the data model: BC parts' `overlapping`
    /// events must all have appeared in an earlier part's `unique` set, and
    /// every part's `unique` set is pairwise disjoint from every other.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen_unique: HashSet<&Event> = HashSet::new();

        for part in &self.parts {
            if self.minimal && !part.overlapping.is_empty() {
                return Err(EngineError::InvalidConfig(format!(
                    "minimal sequence part {} must not declare overlapping events",
                    part.part_index
                )));
            }
            if !self.minimal {
                for event in &part.overlapping {
                    if !seen_unique.contains(event) {
                        return Err(EngineError::InvalidConfig(format!(
                            "sequence part {} overlaps on event '{event}' not introduced by an earlier part",
                            part.part_index
                        )));
                    }
                }
            }
            for event in &part.unique {
                if !seen_unique.insert(event) {
                    return Err(EngineError::InvalidConfig(format!("event '{event}' is introduced by more than one sequence part")));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn combined_events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.parts.iter().flat_map(|p| p.unique.iter().cloned()).collect();
        events.sort();
        events
    }
}

/// Predicts the combined-profile accuracy of a candidate combined event set,
/// without running a real profiler/fusion pass. Implementations typically
/// wrap [`crate::analysis::calibrated_tmd_for_pair`] over cached/simulated
/// data; tests use a closure-backed oracle. Must be `Sync`: `generate_bc_sequence`
/// scores a node's children concurrently over a rayon pool.
pub trait AccuracyOracle {
    fn predicted_tmd_mse(&self, combined_events: &[Event]) -> f64;
}

/// A node in the branch-and-bound search tree.
#[derive(Debug, Clone)]
struct Node {
    combined_events: Vec<Event>,
    sequence: CombinationSequence,
    tmd_mse: f64,
}

fn mi_lookup(mi: &HashMap<(Event, Event), f64>, a: &Event, b: &Event) -> f64 {
    mi.get(&(a.clone(), b.clone())).or_else(|| mi.get(&(b.clone(), a.clone()))).copied().unwrap_or_else(|| {
        log::warn!("no mutual information recorded for event pair ({a}, {b}), assuming 0.0");
        0.0
    })
}

fn average_mi_to_set(mi: &HashMap<(Event, Event), f64>, candidate: &Event, set: &[Event]) -> f64 {
    if set.is_empty() {
        return 0.0;
    }
    set.iter().map(|e| mi_lookup(mi, candidate, e)).sum::<f64>() / set.len() as f64
}

/// Picks the two lowest-MI target events as a seed, then greedily adds the
/// lowest-average-MI remaining event while `is_compatible` holds.
fn pick_root(target_events: &[Event], pairwise_mi: &HashMap<(Event, Event), f64>, is_compatible: &dyn Fn(&[Event]) -> bool) -> Vec<Event> {
    let mut best_pair: Option<(Event, Event, f64)> = None;
    for i in 0..target_events.len() {
        for j in (i + 1)..target_events.len() {
            let mi = mi_lookup(pairwise_mi, &target_events[i], &target_events[j]);
            let better = match &best_pair {
                Some((_, _, bm)) => mi < *bm,
                None => true,
            };
            if better {
                best_pair = Some((target_events[i].clone(), target_events[j].clone(), mi));
            }
        }
    }

    let Some((a, b, _)) = best_pair else { return target_events.to_vec() };
    let mut combined = vec![a, b];

    loop {
        let mut candidate: Option<(Event, f64)> = None;
        for event in target_events {
            if combined.contains(event) {
                continue;
            }
            let ami = average_mi_to_set(pairwise_mi, event, &combined);
            let better = match &candidate {
                Some((_, best)) => ami < *best,
                None => true,
            };
            if better {
                candidate = Some((event.clone(), ami));
            }
        }

        let Some((event, _)) = candidate else { break };
        let mut trial = combined.clone();
        trial.push(event.clone());
        if !is_compatible(&trial) {
            break;
        }
        combined = trial;
    }

    combined
}

/// Generates child `(overlapping, unique)` groupings for a node, for every
/// linking-set size from 1 to `min(max_linking_events, num_pmc - 1)`.
fn expand_children(
    node: &Node,
    target_events: &[Event],
    pairwise_mi: &HashMap<(Event, Event), f64>,
    num_pmc: usize,
    max_linking_events: usize,
    is_compatible: &dyn Fn(&[Event]) -> bool,
) -> Vec<(Vec<Event>, Vec<Event>)> {
    let remaining: Vec<Event> = target_events.iter().filter(|e| !node.combined_events.contains(e)).cloned().collect();
    if remaining.is_empty() {
        return Vec::new();
    }

    let mut seen: HashSet<(Vec<Event>, Vec<Event>)> = HashSet::new();
    let mut children = Vec::new();

    let max_l = max_linking_events.min(num_pmc.saturating_sub(1)).max(1).min(node.combined_events.len());

    for l in 1..=max_l {
        for linking_set in combinations(&node.combined_events, l) {
            let unique_capacity = num_pmc.saturating_sub(l).max(1);

            let mut ranked: Vec<(Event, f64)> =
                remaining.iter().map(|e| (e.clone(), average_mi_to_set(pairwise_mi, e, &linking_set))).collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            let unique_set: Vec<Event> = ranked.into_iter().take(unique_capacity).map(|(e, _)| e).collect();
            if unique_set.is_empty() {
                continue;
            }

            let mut full: Vec<Event> = linking_set.iter().chain(unique_set.iter()).cloned().collect();
            full.sort();
            full.dedup();
            if !is_compatible(&full) {
                continue;
            }

            let mut sorted_linking = linking_set.clone();
            sorted_linking.sort();
            let mut sorted_unique = unique_set.clone();
            sorted_unique.sort();

            if seen.insert((sorted_linking.clone(), sorted_unique.clone())) {
                children.push((sorted_linking, sorted_unique));
            }
        }
    }

    children
}

fn combinations(items: &[Event], k: usize) -> Vec<Vec<Event>> {
    if k == 0 || k > items.len() {
        return Vec::new();
    }
    if k == items.len() {
        return vec![items.to_vec()];
    }

    let mut out = Vec::new();
    let mut indexes: Vec<usize> = (0..k).collect();
    loop {
        out.push(indexes.iter().map(|&i| items[i].clone()).collect());

        let mut i = k;
        loop {
            if i == 0 {
                return out;
            }
            i -= 1;
            if indexes[i] != i + items.len() - k {
                break;
            }
        }
        indexes[i] += 1;
        for j in (i + 1)..k {
            indexes[j] = indexes[j - 1] + 1;
        }
    }
}

/// Branch-and-bound search for a BC combination sequence covering every
/// `target_events`. `num_pmc` is the physical counter count (`K`);
/// `max_linking_events` bounds linking-set size considered per expansion.
/// Returns the lowest-`tmd_mse` complete sequence found.
pub fn generate_bc_sequence(
    target_events: &[Event],
    pairwise_mi: &HashMap<(Event, Event), f64>,
    num_pmc: usize,
    max_linking_events: usize,
    is_compatible: &dyn Fn(&[Event]) -> bool,
    oracle: &(dyn AccuracyOracle + Sync),
) -> Result<CombinationSequence, EngineError> {
    if target_events.len() <= num_pmc {
        return Err(EngineError::PreconditionViolated(
            "generating a combination sequence requires more target events than physical counters".into(),
        ));
    }

    let mut sorted_target = target_events.to_vec();
    sorted_target.sort();

    let root_events = pick_root(&sorted_target, pairwise_mi, is_compatible);
    let mut root_sorted = root_events.clone();
    root_sorted.sort();

    let root = Node {
        combined_events: root_sorted.clone(),
        sequence: CombinationSequence {
            parts: vec![SequencePart { part_index: 0, overlapping: Vec::new(), unique: root_sorted.clone() }],
            minimal: false,
        },
        tmd_mse: oracle.predicted_tmd_mse(&root_sorted),
    };

    let mut best_seen: HashMap<Vec<Event>, f64> = HashMap::new();
    best_seen.insert(root.combined_events.clone(), root.tmd_mse);

    let mut active: Vec<Node> = vec![root];
    let mut best_complete: Option<Node> = None;

    while let Some(pos) = active.iter().enumerate().min_by(|a, b| a.1.tmd_mse.partial_cmp(&b.1.tmd_mse).unwrap_or(std::cmp::Ordering::Equal)).map(|(i, _)| i)
    {
        let node = active.swap_remove(pos);

        if node.combined_events == sorted_target {
            let better = match &best_complete {
                Some(b) => node.tmd_mse < b.tmd_mse,
                None => true,
            };
            if better {
                best_complete = Some(node);
            }
            continue;
        }

        let children = expand_children(&node, &sorted_target, pairwise_mi, num_pmc, max_linking_events, is_compatible);

        // Child evaluation is the expensive, embarrassingly-parallel step (one
        // `oracle.predicted_tmd_mse` call per candidate grouping), mirroring the
        // source's OpenMP task fan-out over `get_child_nodes`'s results. Scored
        // in parallel via rayon's work-stealing pool, then merged into the
        // shared `best_seen`/`active` lists back on this thread.
        let evaluated: Vec<(Vec<Event>, Vec<SequencePart>, f64)> = children
            .into_par_iter()
            .map(|(overlapping, unique)| {
                let mut combined_events = node.combined_events.clone();
                combined_events.extend(unique.iter().cloned());
                combined_events.sort();
                combined_events.dedup();

                let tmd_mse = oracle.predicted_tmd_mse(&combined_events);

                let mut parts = node.sequence.parts.clone();
                #[allow(clippy::cast_possible_truncation)]
                let part_index = parts.len() as u32;
                parts.push(SequencePart { part_index, overlapping, unique });

                (combined_events, parts, tmd_mse)
            })
            .collect();

        for (combined_events, parts, tmd_mse) in evaluated {
            if let Some(&prior) = best_seen.get(&combined_events) {
                if prior <= tmd_mse {
                    continue;
                }
            }
            best_seen.insert(combined_events.clone(), tmd_mse);
            active.push(Node { combined_events, sequence: CombinationSequence { parts, minimal: false }, tmd_mse });
        }
    }

    best_complete.map(|n| n.sequence).ok_or_else(|| {
        EngineError::PreconditionViolated("branch-and-bound search exhausted without reaching the full target event set".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantOracle;
    impl AccuracyOracle for ConstantOracle {
        fn predicted_tmd_mse(&self, combined_events: &[Event]) -> f64 {
            1.0 / combined_events.len() as f64
        }
    }

    fn always_compatible(_events: &[Event]) -> bool {
        true
    }

    fn events(names: &[&str]) -> Vec<Event> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn sequence_validate_rejects_overlap_on_unintroduced_event() {
        let sequence = CombinationSequence {
            parts: vec![SequencePart { part_index: 0, overlapping: vec!["a".to_string()], unique: vec!["b".to_string()] }],
            minimal: false,
        };
        assert!(sequence.validate().is_err());
    }

    #[test]
    fn sequence_validate_rejects_duplicate_unique_event() {
        let sequence = CombinationSequence {
            parts: vec![
                SequencePart { part_index: 0, overlapping: vec![], unique: vec!["a".to_string()] },
                SequencePart { part_index: 1, overlapping: vec![], unique: vec!["a".to_string()] },
            ],
            minimal: false,
        };
        assert!(sequence.validate().is_err());
    }

    #[test]
    fn minimal_sequence_rejects_overlapping_events() {
        let sequence = CombinationSequence {
            parts: vec![SequencePart { part_index: 0, overlapping: vec!["a".to_string()], unique: vec!["b".to_string()] }],
            minimal: true,
        };
        assert!(sequence.validate().is_err());
    }

    #[test]
    fn generate_bc_sequence_covers_every_target_event() {
        let target = events(&["a", "b", "c", "d", "e"]);
        let mi = HashMap::new();
        let sequence = generate_bc_sequence(&target, &mi, 2, 2, &always_compatible, &ConstantOracle).unwrap();
        sequence.validate().unwrap();
        let mut combined = sequence.combined_events();
        combined.sort();
        let mut expected = target.clone();
        expected.sort();
        assert_eq!(combined, expected);
    }

    #[test]
    fn generate_bc_sequence_rejects_when_events_fit_in_one_profile() {
        let target = events(&["a", "b"]);
        let mi = HashMap::new();
        assert!(generate_bc_sequence(&target, &mi, 4, 2, &always_compatible, &ConstantOracle).is_err());
    }

    #[test]
    fn combinations_of_two_from_three_yields_three_pairs() {
        let items = events(&["a", "b", "c"]);
        let combos = combinations(&items, 2);
        assert_eq!(combos.len(), 3);
    }
}
