//! Transportation (earth-mover) distance and calibration
//!
//! Builds a bounded signature from a raw instance distribution and computes
//! the distance between two signatures with Euclidean ground distance and
//! zero extra-mass penalty. Grounded on `analysis.cpp`'s
//! `convert_distribution_to_bounded_signature`/`calculate_uncalibrated_tmd`.
//! The transportation solve itself uses a greedy nearest-bin allocation
//! rather than the source's `fast_emd` network-simplex solver: bit-for-bit
//! parity isn't required (see `DESIGN.md`), only the symmetry/self-distance/
//! outlier-sensitivity properties.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use crate::domain::errors::EngineError;
use crate::domain::types::{Event, Symbol};
use crate::statistics::{median_from_values, stats_from_values, weighted_geometric_mean};

const CALIBRATION_CSV_HEADER: &[&str] = &["symbol", "reference_idx", "events", "min", "max", "mean", "std", "median", "mean_num_instances"];

/// One populated bin: its fractional coordinate and its share of the total
/// instance mass.
#[derive(Debug, Clone)]
struct Signature {
    coords: Vec<Vec<f64>>,
    weights: Vec<f64>,
}

fn build_signature_with_bins(distribution: &[Vec<i64>], bounds_per_dimension: &[(i64, i64)], num_bins: u32) -> Result<Signature, EngineError> {
    if distribution.is_empty() {
        return Err(EngineError::PreconditionViolated("cannot build a TMD signature from an empty distribution".into()));
    }

    let bin_size: Vec<f64> = bounds_per_dimension.iter().map(|(min, max)| (*max - *min) as f64 / f64::from(num_bins)).collect();

    let mut bins: HashMap<Vec<i32>, (u32, Vec<i64>)> = HashMap::new();

    for instance in distribution {
        let mut coord = Vec::with_capacity(bounds_per_dimension.len());
        for (dim, &(min_e, max_e)) in bounds_per_dimension.iter().enumerate() {
            if bin_size[dim] == 0.0 {
                coord.push(0);
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let mut c = ((instance[dim] - min_e) as f64 / bin_size[dim]) as i32;
            if instance[dim] == max_e {
                c -= 1;
            }
            #[allow(clippy::cast_possible_wrap)]
            let num_bins_signed = num_bins as i32;
            if c < 0 {
                c = -1;
            } else if c > num_bins_signed {
                c = num_bins_signed;
            }
            coord.push(c);
        }

        let entry = bins.entry(coord).or_insert_with(|| (0, vec![0; bounds_per_dimension.len()]));
        entry.0 += 1;
        for (dim, value) in instance.iter().enumerate() {
            entry.1[dim] += value;
        }
    }

    let total = distribution.len() as f64;
    let mut coords = Vec::with_capacity(bins.len());
    let mut weights = Vec::with_capacity(bins.len());

    for (bin_coord, (count, summed)) in bins {
        let mut resolved = Vec::with_capacity(bin_coord.len());
        for (dim, &(min_e, _)) in bounds_per_dimension.iter().enumerate() {
            if bin_size[dim] == 0.0 {
                resolved.push(0.0);
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let mean_value = summed[dim] as f64 / f64::from(count);
            resolved.push((mean_value - min_e as f64) / bin_size[dim]);
        }
        coords.push(resolved);
        weights.push(f64::from(count) / total);
    }

    Ok(Signature { coords, weights })
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

/// Greedy nearest-bin transportation solve: repeatedly saturates the closest
/// still-unsatisfied (source, sink) bin pair. Both signatures carry equal
/// total mass (1.0), so there is no unmatched residual (extra-mass
/// penalty = 0).
fn transportation_distance(a: &Signature, b: &Signature) -> f64 {
    let mut remaining_a = a.weights.clone();
    let mut remaining_b = b.weights.clone();
    let mut total_cost = 0.0;

    loop {
        let mut best: Option<(usize, usize, f64)> = None;
        for (i, ra) in remaining_a.iter().enumerate() {
            if *ra <= f64::EPSILON {
                continue;
            }
            for (j, rb) in remaining_b.iter().enumerate() {
                if *rb <= f64::EPSILON {
                    continue;
                }
                let d = euclidean(&a.coords[i], &b.coords[j]);
                let better = match best {
                    Some((_, _, bd)) => d < bd,
                    None => true,
                };
                if better {
                    best = Some((i, j, d));
                }
            }
        }

        let Some((i, j, d)) = best else { break };
        let flow = remaining_a[i].min(remaining_b[j]);
        total_cost += flow * d;
        remaining_a[i] -= flow;
        remaining_b[j] -= flow;
    }

    total_cost
}

/// Transportation distance between two raw instance distributions, each
/// projected onto the same event set. `bounds_per_dim` and `distribution_*`
/// dimensions must agree in count and order.
pub fn uncalibrated_tmd(distribution_one: &[Vec<i64>], distribution_two: &[Vec<i64>], bounds_per_dim: &[(i64, i64)], num_bins: u32) -> Result<f64, EngineError> {
    let signature_one = build_signature_with_bins(distribution_one, bounds_per_dim, num_bins)?;
    let signature_two = build_signature_with_bins(distribution_two, bounds_per_dim, num_bins)?;
    Ok(transportation_distance(&signature_one, &signature_two))
}

/// Self-distance baseline for one reference pair/symbol: the distribution of
/// TMDs measured between every 2-combination of reference repeats.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationEntry {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    pub mean_num_instances: f64,
}

/// Computes a calibration entry from every 2-combination of reference-repeat
/// distributions for one (event pair, symbol). Grounded on spec §4.5.
pub fn compute_calibration_entry(repeats: &[Vec<Vec<i64>>], bounds_per_dim: &[(i64, i64)], num_bins: u32) -> Result<CalibrationEntry, EngineError> {
    if repeats.len() < 2 {
        return Err(EngineError::PreconditionViolated(format!(
            "calibration requires at least 2 reference repeats, found {}",
            repeats.len()
        )));
    }

    let mut tmds = Vec::new();
    for i in 0..repeats.len() {
        for j in (i + 1)..repeats.len() {
            tmds.push(uncalibrated_tmd(&repeats[i], &repeats[j], bounds_per_dim, num_bins)?);
        }
    }

    let stats = stats_from_values(tmds.clone())?;
    let median = median_from_values(tmds)?;
    #[allow(clippy::cast_precision_loss)]
    let mean_num_instances = repeats.iter().map(Vec::len).sum::<usize>() as f64 / repeats.len() as f64;

    Ok(CalibrationEntry { min: stats.min, max: stats.max, mean: stats.mean, std: stats.std, median, mean_num_instances })
}

fn events_key(events: &[Event]) -> String {
    events.join("-")
}

/// Persisted self-distance baselines, keyed by `(symbol, reference_idx,
/// events)`. A row already present for a key is never recomputed.
#[derive(Default)]
pub struct CalibrationTable {
    entries: HashMap<(Symbol, u32, String), CalibrationEntry>,
}

impl CalibrationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, symbol: &Symbol, reference_idx: u32, events: &[Event]) -> bool {
        self.entries.contains_key(&(symbol.clone(), reference_idx, events_key(events)))
    }

    pub fn insert(&mut self, symbol: Symbol, reference_idx: u32, events: &[Event], entry: CalibrationEntry) {
        self.entries.insert((symbol, reference_idx, events_key(events)), entry);
    }

    pub fn get(&self, symbol: &Symbol, reference_idx: u32, events: &[Event]) -> Result<CalibrationEntry, EngineError> {
        self.entries.get(&(symbol.clone(), reference_idx, events_key(events))).copied().ok_or_else(|| {
            EngineError::DataNotFound(format!("no calibration entry for symbol '{symbol}', reference {reference_idx}, events {events:?}"))
        })
    }

    /// Divides a raw TMD by the stored median self-distance for the same
    /// key, yielding a calibrated (dimensionless) accuracy figure.
    pub fn calibrate(&self, raw_tmd: f64, symbol: &Symbol, reference_idx: u32, events: &[Event]) -> Result<f64, EngineError> {
        let entry = self.get(symbol, reference_idx, events)?;
        if entry.median == 0.0 {
            return Err(EngineError::PreconditionViolated(format!(
                "calibration median is 0.0 for symbol '{symbol}', reference {reference_idx}, events {events:?}"
            )));
        }
        Ok(raw_tmd / entry.median)
    }

    pub fn load(&mut self, path: &Path) -> Result<(), EngineError> {
        if !path.exists() {
            return Ok(());
        }
        let file = File::open(path).map_err(|e| EngineError::io(path.display().to_string(), e))?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);

        for result in reader.records() {
            let record = result?;
            let symbol = record[0].to_string();
            let reference_idx: u32 =
                record[1].parse().map_err(|_| EngineError::InvalidConfig(format!("could not parse reference_idx '{}'", &record[1])))?;
            let events: Vec<Event> = record[2].split('-').map(ToString::to_string).collect();
            let entry = CalibrationEntry {
                min: parse_f64(&record[3])?,
                max: parse_f64(&record[4])?,
                mean: parse_f64(&record[5])?,
                std: parse_f64(&record[6])?,
                median: parse_f64(&record[7])?,
                mean_num_instances: parse_f64(&record[8])?,
            };
            self.entries.insert((symbol, reference_idx, events_key(&events)), entry);
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let file = File::create(path).map_err(|e| EngineError::io(path.display().to_string(), e))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(CALIBRATION_CSV_HEADER)?;

        for ((symbol, reference_idx, events), entry) in &self.entries {
            writer.write_record(&[
                symbol.clone(),
                reference_idx.to_string(),
                events.clone(),
                entry.min.to_string(),
                entry.max.to_string(),
                entry.mean.to_string(),
                entry.std.to_string(),
                entry.median.to_string(),
                entry.mean_num_instances.to_string(),
            ])?;
        }

        writer.flush().map_err(|e| EngineError::io(path.display().to_string(), e.into()))?;
        Ok(())
    }
}

fn parse_f64(field: &str) -> Result<f64, EngineError> {
    field.parse().map_err(|_| EngineError::InvalidConfig(format!("could not parse '{field}' as a number in calibration row")))
}

/// Calibrated TMD for one event pair, averaged over reference repeats and
/// aggregated across symbols via the weighted geometric mean (weights = mean
/// instance counts). Grounded on spec §4.4's "calibrated TMD for a pair".
pub fn calibrated_tmd_for_pair(
    per_symbol_raw_tmds: &HashMap<Symbol, Vec<f64>>,
    calibration: &CalibrationTable,
    reference_idx: u32,
    events: &[Event],
) -> Result<f64, EngineError> {
    if per_symbol_raw_tmds.is_empty() {
        return Err(EngineError::PreconditionViolated("cannot calculate a calibrated TMD with no symbol measurements".into()));
    }

    let mut calibrated_values = Vec::with_capacity(per_symbol_raw_tmds.len());
    let mut weights = Vec::with_capacity(per_symbol_raw_tmds.len());

    for (symbol, raw_tmds) in per_symbol_raw_tmds {
        if raw_tmds.is_empty() {
            continue;
        }
        #[allow(clippy::cast_precision_loss)]
        let mean_raw = raw_tmds.iter().sum::<f64>() / raw_tmds.len() as f64;
        let calibrated = calibration.calibrate(mean_raw, symbol, reference_idx, events)?;
        let entry = calibration.get(symbol, reference_idx, events)?;
        calibrated_values.push(calibrated);
        weights.push(entry.mean_num_instances);
    }

    Ok(weighted_geometric_mean(&calibrated_values, &weights))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_distributions_have_zero_tmd() {
        let distribution = vec![vec![1, 2], vec![3, 4], vec![5, 6]];
        let bounds = vec![(0, 10), (0, 10)];
        let tmd = uncalibrated_tmd(&distribution, &distribution, &bounds, 5).unwrap();
        assert!(tmd.abs() < 1e-9);
    }

    #[test]
    fn tmd_is_symmetric() {
        let a = vec![vec![1, 1], vec![9, 9]];
        let b = vec![vec![2, 2], vec![8, 8]];
        let bounds = vec![(0, 10), (0, 10)];
        let ab = uncalibrated_tmd(&a, &b, &bounds, 5).unwrap();
        let ba = uncalibrated_tmd(&b, &a, &bounds, 5).unwrap();
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn single_outlier_increases_distance() {
        let a = vec![vec![5, 5]; 10];
        let b_close = vec![vec![5, 5]; 10];
        let mut b_far = vec![vec![5, 5]; 9];
        b_far.push(vec![50, 50]);

        let bounds = vec![(0, 60), (0, 60)];
        let close = uncalibrated_tmd(&a, &b_close, &bounds, 10).unwrap();
        let far = uncalibrated_tmd(&a, &b_far, &bounds, 10).unwrap();
        assert!(far > close);
    }

    #[test]
    fn empty_distribution_is_rejected() {
        let bounds = vec![(0, 10)];
        assert!(uncalibrated_tmd(&[], &[vec![1]], &bounds, 5).is_err());
    }

    #[test]
    fn calibration_table_round_trips_through_csv() {
        let mut table = CalibrationTable::new();
        let events = vec!["cycles".to_string(), "instructions".to_string()];
        table.insert(
            "foo".to_string(),
            0,
            &events,
            CalibrationEntry { min: 0.1, max: 0.9, mean: 0.5, std: 0.2, median: 0.45, mean_num_instances: 12.0 },
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.csv");
        table.save(&path).unwrap();

        let mut loaded = CalibrationTable::new();
        loaded.load(&path).unwrap();
        assert!(loaded.contains(&"foo".to_string(), 0, &events));
        let entry = loaded.get(&"foo".to_string(), 0, &events).unwrap();
        assert!((entry.median - 0.45).abs() < 1e-9);
    }

    #[test]
    fn calibrate_divides_by_stored_median() {
        let mut table = CalibrationTable::new();
        let events = vec!["cycles".to_string()];
        table.insert(
            "foo".to_string(),
            0,
            &events,
            CalibrationEntry { min: 0.0, max: 1.0, mean: 0.5, std: 0.1, median: 2.0, mean_num_instances: 4.0 },
        );
        let calibrated = table.calibrate(4.0, &"foo".to_string(), 0, &events).unwrap();
        assert!((calibrated - 2.0).abs() < 1e-9);
    }
}
