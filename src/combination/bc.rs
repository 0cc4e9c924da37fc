//! Bounded clustering (BC)
//!
//! Matches instances of two profiles via an adaptively refined grid over
//! `overlapping_events`, falling back to label-matching inside each shared
//! cell. Grounded on `combination.cpp`'s `extract_matched_instances_bc`,
//! `bc_find_maximum_granularity`, `bc_allocate_to_clusters`,
//! `get_closest_clusters`, `find_minimum_pairwise_distance_brute_force` and
//! `relax_similarity_constraint`.

use std::collections::{HashMap, HashSet};

use crate::domain::errors::EngineError;
use crate::domain::types::Event;
use crate::profile::{ExecutionProfile, Instance};
use crate::statistics::Statistics;

use super::combine_instances;

type Cluster = Vec<u32>;

/// Folds a sequence of profiles pairwise into one BC-combined instance list,
/// per symbol. Grounded on `generate_combined_instances_bc`.
pub(super) fn generate_combined_instances_bc(
    profiles: &[ExecutionProfile],
    overlapping_per_profile: &[Vec<Event>],
    statistics: &Statistics,
) -> Result<Vec<Instance>, EngineError> {
    let initial_profile = &profiles[0];
    let symbols = initial_profile.get_unique_symbols(false);

    let mut previous_instances_per_symbol: HashMap<String, Vec<Instance>> = HashMap::new();
    for symbol in &symbols {
        let instances = initial_profile
            .get_instances(false, std::slice::from_ref(symbol))
            .into_iter()
            .map(|id| initial_profile.instance(id).clone())
            .collect();
        previous_instances_per_symbol.insert(symbol.clone(), instances);
    }

    for combination_idx in 1..profiles.len() {
        let next_profile = &profiles[combination_idx];
        let overlapping_events = overlapping_per_profile.get(combination_idx).ok_or_else(|| {
            EngineError::PreconditionViolated(format!("no overlapping events supplied for profile index {combination_idx}"))
        })?;
        if overlapping_events.is_empty() {
            return Err(EngineError::PreconditionViolated(
                "BC combination strategy requires overlapping events between profiles, but none were provided".into(),
            ));
        }

        let mut combined_instances_per_symbol: HashMap<String, Vec<Instance>> = HashMap::new();

        for symbol in &symbols {
            let a = previous_instances_per_symbol.get(symbol).cloned().unwrap_or_default();
            let b: Vec<Instance> = next_profile
                .get_instances(false, std::slice::from_ref(symbol))
                .into_iter()
                .map(|id| next_profile.instance(id).clone())
                .collect();

            log::debug!("clustering instances of symbol [{symbol}] via BC ({combination_idx}/{})", profiles.len() - 1);

            let (matched, remaining_a, remaining_b) = extract_matched_instances_bc(a, b, overlapping_events, statistics)?;

            if !remaining_a.is_empty() || !remaining_b.is_empty() {
                log::warn!(
                    "uncombined instances remained for symbol '{symbol}' after BC combination ({} and {})",
                    remaining_a.len(),
                    remaining_b.len()
                );
            }

            let combined: Vec<Instance> = matched.into_iter().map(|pair| combine_instances(&pair)).collect();
            combined_instances_per_symbol.insert(symbol.clone(), combined);
        }

        previous_instances_per_symbol = combined_instances_per_symbol;
    }

    Ok(previous_instances_per_symbol.into_values().flatten().collect())
}

/// Matches exactly two profiles' instance lists for one symbol. Returns the
/// matched pairs plus whatever residual instances never found a cell-mate.
fn extract_matched_instances_bc(
    instances_a: Vec<Instance>,
    instances_b: Vec<Instance>,
    overlapping_events: &[Event],
    statistics: &Statistics,
) -> Result<(Vec<[Instance; 2]>, Vec<Instance>, Vec<Instance>), EngineError> {
    let mut matched = Vec::new();

    if instances_a.is_empty() || instances_b.is_empty() {
        return Ok((matched, instances_a, instances_b));
    }

    let symbol = instances_a[0].symbol.clone();
    let mut bounds = Vec::with_capacity(overlapping_events.len());
    for event in overlapping_events {
        bounds.push(statistics.bounds(event, &symbol)?);
    }

    let mut g = initial_granularity(&instances_a, &instances_b, overlapping_events, &bounds);
    log::debug!("initial granularity for BC was {g}");

    let mut removed_a: HashSet<usize> = HashSet::new();
    let mut removed_b: HashSet<usize> = HashSet::new();

    loop {
        let clusters_a = allocate_to_clusters(&instances_a, overlapping_events, &bounds, g);
        let clusters_b = allocate_to_clusters(&instances_b, overlapping_events, &bounds, g);

        for (cluster, idxs_a) in &clusters_a {
            let Some(idxs_b) = clusters_b.get(cluster) else { continue };
            let live_a: Vec<usize> = idxs_a.iter().copied().filter(|i| !removed_a.contains(i)).collect();
            let live_b: Vec<usize> = idxs_b.iter().copied().filter(|i| !removed_b.contains(i)).collect();
            if live_a.is_empty() || live_b.is_empty() {
                continue;
            }

            for (ia, ib) in match_within_cluster(&live_a, &live_b, &instances_a, &instances_b) {
                matched.push([instances_a[ia].clone(), instances_b[ib].clone()]);
                removed_a.insert(ia);
                removed_b.insert(ib);
            }
        }

        if instances_a.len() == removed_a.len() || instances_b.len() == removed_b.len() {
            break;
        }

        g = relax_granularity(g, &clusters_a, &clusters_b, &removed_a, &removed_b, &instances_a, &instances_b, overlapping_events, &bounds);
    }

    let remaining_a: Vec<Instance> =
        instances_a.iter().enumerate().filter(|(i, _)| !removed_a.contains(i)).map(|(_, v)| v.clone()).collect();
    let remaining_b: Vec<Instance> =
        instances_b.iter().enumerate().filter(|(i, _)| !removed_b.contains(i)).map(|(_, v)| v.clone()).collect();

    Ok((matched, remaining_a, remaining_b))
}

fn match_within_cluster(a_idx: &[usize], b_idx: &[usize], instances_a: &[Instance], instances_b: &[Instance]) -> Vec<(usize, usize)> {
    let mut a_sorted = a_idx.to_vec();
    let mut b_sorted = b_idx.to_vec();
    a_sorted.sort_by(|&i, &j| instances_a[i].label.dfs_cmp(&instances_a[j].label));
    b_sorted.sort_by(|&i, &j| instances_b[i].label.dfs_cmp(&instances_b[j].label));
    let common = a_sorted.len().min(b_sorted.len());
    a_sorted.into_iter().zip(b_sorted).take(common).collect()
}

/// Per-dimension minimum of `(range / min_pairwise_gap)`; 1 if either side
/// has ≤1 value or the minimum gap is 0.
fn initial_granularity(instances_a: &[Instance], instances_b: &[Instance], overlapping_events: &[Event], bounds: &[(i64, i64)]) -> u32 {
    let mut granularity = u32::MAX;

    for (event_idx, event) in overlapping_events.iter().enumerate() {
        let mut values_a: Vec<i64> = instances_a.iter().filter_map(|i| i.get_event_value(event)).collect();
        let mut values_b: Vec<i64> = instances_b.iter().filter_map(|i| i.get_event_value(event)).collect();
        values_a.sort_unstable();
        values_b.sort_unstable();

        if values_a.len() <= 1 || values_b.len() <= 1 {
            return 1;
        }

        let mut min_diff = u64::MAX;
        let (mut ai, mut bi) = (0usize, 0usize);
        while ai < values_a.len() && bi < values_b.len() {
            let diff = values_a[ai] - values_b[bi];
            let abs_diff = diff.unsigned_abs();
            if abs_diff < min_diff {
                min_diff = abs_diff;
            }
            if diff < 0 {
                ai += 1;
            } else {
                bi += 1;
            }
        }

        if min_diff == 0 {
            return 1;
        }

        let (min_e, max_e) = bounds[event_idx];
        let cells = ((max_e - min_e) as u64 / min_diff) as u32;
        if cells < granularity {
            granularity = cells;
        }
    }

    granularity.max(1)
}

/// Cell coordinate for value `v` is `floor((v-min)/(max-min) * g)`,
/// decremented when `v == max` and the coordinate is `> 0`. `g == 1`
/// short-circuits to a single bucket.
fn allocate_to_clusters(instances: &[Instance], overlapping_events: &[Event], bounds: &[(i64, i64)], granularity: u32) -> HashMap<Cluster, Vec<usize>> {
    let mut clusters: HashMap<Cluster, Vec<usize>> = HashMap::new();

    if granularity == 1 {
        clusters.insert(vec![0], (0..instances.len()).collect());
        return clusters;
    }

    for (idx, instance) in instances.iter().enumerate() {
        let mut cluster = Vec::with_capacity(overlapping_events.len());
        for (event_idx, event) in overlapping_events.iter().enumerate() {
            let (min_e, max_e) = bounds[event_idx];
            if min_e == max_e {
                cluster.push(0);
                continue;
            }
            let value = instance.get_event_value(event).unwrap_or(min_e);
            #[allow(clippy::cast_sign_loss, clippy::cast_precision_loss, clippy::cast_possible_truncation)]
            let mut coord = (((value - min_e) as f64 / (max_e - min_e) as f64) * f64::from(granularity)) as u32;
            if value == max_e && coord > 0 {
                coord -= 1;
            }
            cluster.push(coord);
        }
        clusters.entry(cluster).or_default().push(idx);
    }

    clusters
}

#[allow(clippy::too_many_arguments)]
fn relax_granularity(
    current_g: u32,
    clusters_a: &HashMap<Cluster, Vec<usize>>,
    clusters_b: &HashMap<Cluster, Vec<usize>>,
    removed_a: &HashSet<usize>,
    removed_b: &HashSet<usize>,
    instances_a: &[Instance],
    instances_b: &[Instance],
    overlapping_events: &[Event],
    bounds: &[(i64, i64)],
) -> u32 {
    let d_star =
        find_minimum_pairwise_distance(clusters_a, clusters_b, removed_a, removed_b, instances_a, instances_b, overlapping_events, bounds, current_g);

    if d_star == 0.0 {
        return 1;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mut next_g = ((1.0 / (1.0 + d_star)) * f64::from(current_g)).ceil() as u32;
    if next_g == current_g {
        next_g = next_g.saturating_sub(1);
    }
    next_g.max(1)
}

fn get_closest_clusters(
    clusters_a: &HashMap<Cluster, Vec<usize>>,
    clusters_b: &HashMap<Cluster, Vec<usize>>,
    removed_a: &HashSet<usize>,
    removed_b: &HashSet<usize>,
) -> Vec<(Cluster, Cluster)> {
    let all_coords: Vec<Cluster> = clusters_a.keys().cloned().chain(clusters_b.keys().cloned()).collect();

    let has_unmerged = |coord: &Cluster, clusters: &HashMap<Cluster, Vec<usize>>, removed: &HashSet<usize>| -> bool {
        clusters.get(coord).is_some_and(|idxs| idxs.iter().any(|i| !removed.contains(i)))
    };

    let mut min_sq = f64::MAX;
    let mut closest = Vec::new();

    for i in 0..all_coords.len() {
        for j in (i + 1)..all_coords.len() {
            let (ci, cj) = (&all_coords[i], &all_coords[j]);
            let sq: f64 = ci.iter().zip(cj.iter()).map(|(a, b)| (f64::from(*a) - f64::from(*b)).powi(2)).sum();

            if sq > min_sq {
                continue;
            }

            let forward = has_unmerged(ci, clusters_a, removed_a) && has_unmerged(cj, clusters_b, removed_b);
            let backward = has_unmerged(cj, clusters_a, removed_a) && has_unmerged(ci, clusters_b, removed_b);
            if !forward && !backward {
                continue;
            }

            if sq < min_sq {
                min_sq = sq;
                closest.clear();
            }
            closest.push((ci.clone(), cj.clone()));
        }
    }

    closest
}

#[allow(clippy::too_many_arguments)]
fn find_minimum_pairwise_distance(
    clusters_a: &HashMap<Cluster, Vec<usize>>,
    clusters_b: &HashMap<Cluster, Vec<usize>>,
    removed_a: &HashSet<usize>,
    removed_b: &HashSet<usize>,
    instances_a: &[Instance],
    instances_b: &[Instance],
    overlapping_events: &[Event],
    bounds: &[(i64, i64)],
    granularity: u32,
) -> f64 {
    let closest = get_closest_clusters(clusters_a, clusters_b, removed_a, removed_b);

    let gather = |coord: &Cluster| -> Vec<Instance> {
        let mut out = Vec::new();
        if let Some(idxs) = clusters_a.get(coord) {
            out.extend(idxs.iter().filter(|i| !removed_a.contains(i)).map(|&i| instances_a[i].clone()));
        }
        if let Some(idxs) = clusters_b.get(coord) {
            out.extend(idxs.iter().filter(|i| !removed_b.contains(i)).map(|&i| instances_b[i].clone()));
        }
        out
    };

    let mut min_sq = f64::MAX;
    let mut largest_single_dim = 0.0_f64;

    for (c1, c2) in &closest {
        let group_one = gather(c1);
        let group_two = gather(c2);

        for a in &group_one {
            for b in &group_two {
                let mut sq = 0.0_f64;
                let mut local_largest = 0.0_f64;
                for (k, event) in overlapping_events.iter().enumerate() {
                    let va = a.get_event_value(event).unwrap_or(0);
                    let vb = b.get_event_value(event).unwrap_or(0);
                    #[allow(clippy::cast_precision_loss)]
                    let diff = (va - vb).unsigned_abs() as f64;
                    let range = (bounds[k].1 - bounds[k].0) as f64;
                    let bin_distance = if range == 0.0 { 0.0 } else { diff / (range / f64::from(granularity)) };
                    if bin_distance > local_largest {
                        local_largest = bin_distance;
                    }
                    sq += bin_distance * bin_distance;
                }

                if (sq - min_sq).abs() < f64::EPSILON {
                    if local_largest < largest_single_dim {
                        largest_single_dim = local_largest;
                    }
                } else if sq < min_sq {
                    min_sq = sq;
                    largest_single_dim = local_largest;
                }
            }
        }
    }

    largest_single_dim
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{CpuId, Label};

    fn make_instance(symbol: &str, label: i64, event: &str, value: i64) -> Instance {
        let mut i = Instance::new(symbol.to_string(), Label(vec![label]), CpuId(0), 0, 1, false).unwrap();
        i.set_event_value(event.to_string(), value);
        i
    }

    fn stats_with_bounds(event: &str, symbol: &str, min: i64, max: i64) -> Statistics {
        let mut stats = Statistics::new();
        stats.add(&event.to_string(), min, &symbol.to_string());
        stats.add(&event.to_string(), max, &symbol.to_string());
        stats.finalize();
        stats
    }

    #[test]
    fn single_overlapping_event_eventually_matches_both_pairs() {
        let a = vec![make_instance("foo", 0, "e_o", 10), make_instance("foo", 1, "e_o", 90)];
        let b = vec![make_instance("foo", 0, "e_o", 11), make_instance("foo", 1, "e_o", 89)];

        let stats = stats_with_bounds("e_o", "foo", 0, 100);
        let overlapping = vec!["e_o".to_string()];

        let (matched, remaining_a, remaining_b) = extract_matched_instances_bc(a, b, &overlapping, &stats).unwrap();
        assert_eq!(matched.len(), 2);
        assert!(remaining_a.is_empty());
        assert!(remaining_b.is_empty());
    }

    #[test]
    fn empty_profile_produces_no_matches() {
        let stats = stats_with_bounds("e_o", "foo", 0, 100);
        let (matched, remaining_a, remaining_b) = extract_matched_instances_bc(vec![], vec![make_instance("foo", 0, "e_o", 1)], &["e_o".to_string()], &stats).unwrap();
        assert!(matched.is_empty());
        assert!(remaining_a.is_empty());
        assert_eq!(remaining_b.len(), 1);
    }

    #[test]
    fn granularity_one_allocates_everything_to_a_single_cluster() {
        let instances = vec![make_instance("foo", 0, "e", 1), make_instance("foo", 1, "e", 99)];
        let clusters = allocate_to_clusters(&instances, &["e".to_string()], &[(0, 100)], 1);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters.values().next().unwrap().len(), 2);
    }
}
