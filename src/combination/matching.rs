//! Random, chronological and label-based instance matchers
//!
//! Each matcher sorts (or shuffles) every profile's instance list
//! independently, then zips positionally to the common minimum length.
//! Grounded on `combination.cpp`'s `extract_matched_instances_*` family.

use rand::seq::SliceRandom;
use rand::RngCore;

use crate::profile::Instance;

pub(super) fn extract_matched_instances_random(
    mut instances_per_profile: Vec<Vec<Instance>>,
    rng: &mut dyn RngCore,
) -> Vec<Vec<Instance>> {
    for list in &mut instances_per_profile {
        list.shuffle(rng);
    }
    zip_to_common_length(instances_per_profile, "randomly")
}

pub(super) fn extract_matched_instances_chronological(mut instances_per_profile: Vec<Vec<Instance>>) -> Vec<Vec<Instance>> {
    for list in &mut instances_per_profile {
        list.sort_by(|a, b| a.start.cmp(&b.start));
    }
    zip_to_common_length(instances_per_profile, "chronologically")
}

pub(super) fn extract_matched_instances_by_label(mut instances_per_profile: Vec<Vec<Instance>>) -> Vec<Vec<Instance>> {
    for list in &mut instances_per_profile {
        list.sort_by(|a, b| a.label.dfs_cmp(&b.label));
    }

    let matched = zip_to_common_length(instances_per_profile, "by matching label");

    for group in &matched {
        let first_label = group[0].label.to_string();
        if group.iter().any(|i| i.label.to_string() != first_label) {
            let labels: Vec<String> = group.iter().map(|i| i.label.to_string()).collect();
            log::warn!("LGL strategy matched different labels across profiles: {labels:?}");
        }
    }

    matched
}

fn zip_to_common_length(instances_per_profile: Vec<Vec<Instance>>, how: &str) -> Vec<Vec<Instance>> {
    let counts: Vec<usize> = instances_per_profile.iter().map(Vec::len).collect();
    if counts.windows(2).any(|w| w[0] != w[1]) {
        log::warn!(
            "found variable instance counts when combining instances from {} sequence profiles {how}: {counts:?}",
            instances_per_profile.len()
        );
    }

    let common = counts.iter().copied().min().unwrap_or(0);
    (0..common).map(|idx| instances_per_profile.iter().map(|list| list[idx].clone()).collect()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{CpuId, Label};

    fn instance(label: i64, start: u64) -> Instance {
        let mut i = Instance::new("foo".into(), Label(vec![label]), CpuId(0), start, start + 1, false).unwrap();
        i.set_event_value("e".into(), label);
        i
    }

    #[test]
    fn chronological_pairs_by_ascending_start() {
        let p1 = vec![instance(0, 5), instance(1, 1)];
        let p2 = vec![instance(0, 2), instance(1, 4)];
        let matched = extract_matched_instances_chronological(vec![p1, p2]);
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0][0].start, 1);
        assert_eq!(matched[0][1].start, 2);
        assert_eq!(matched[1][0].start, 5);
        assert_eq!(matched[1][1].start, 4);
    }

    #[test]
    fn label_match_zips_by_sorted_label() {
        let p1 = vec![instance(2, 0), instance(0, 0)];
        let p2 = vec![instance(0, 0), instance(2, 0)];
        let matched = extract_matched_instances_by_label(vec![p1, p2]);
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0][0].label, matched[0][1].label);
        assert_eq!(matched[1][0].label, matched[1][1].label);
    }

    #[test]
    fn common_length_truncates_to_shortest_profile() {
        let p1 = vec![instance(0, 0), instance(1, 1), instance(2, 2)];
        let p2 = vec![instance(0, 0)];
        let matched = extract_matched_instances_chronological(vec![p1, p2]);
        assert_eq!(matched.len(), 1);
    }
}
