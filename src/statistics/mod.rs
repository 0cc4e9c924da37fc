//! Running-statistics accumulator
//!
//! A per-(symbol,event) Welford accumulator plus the closed-form stats derived
//! from it. The source keeps the running state in arbitrary-precision GMP
//! floats; this port uses `f64` throughout (see `DESIGN.md`) since the
//! testable properties only require a stable textual round-trip, not
//! bit-identical arithmetic across billions of samples.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use crate::domain::errors::EngineError;
use crate::domain::types::{Event, Symbol, ALL_SYMBOLS, RUNTIME_SYMBOL};

const CSV_HEADER: &[&str] = &[
    "symbol", "event", "minimum", "maximum", "mean", "std", "n", "old_m", "new_m", "old_s", "new_s",
];

/// Closed-form statistics for one (symbol, event) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Copy)]
struct Welford {
    n: f64,
    old_m: f64,
    new_m: f64,
    old_s: f64,
    new_s: f64,
    min: f64,
    max: f64,
}

impl Welford {
    fn first(value: f64) -> Self {
        Welford { n: 1.0, old_m: value, new_m: value, old_s: 0.0, new_s: 0.0, min: value, max: value }
    }

    fn add(&mut self, value: f64) {
        self.n += 1.0;
        let delta = value - self.old_m;
        self.new_m = self.old_m + delta / self.n;
        self.new_s = self.old_s + delta * (value - self.new_m);
        self.old_m = self.new_m;
        self.old_s = self.new_s;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    fn finalize(&self, symbol: &str, event: &str) -> Stats {
        if self.n < 2.0 {
            log::warn!(
                "only {} value(s) for symbol '{symbol}' and event '{event}', variance set to 0.0",
                self.n as u64
            );
            return Stats { min: self.min, max: self.max, mean: self.min, std: 0.0 };
        }
        let variance = self.new_s / (self.n - 1.0);
        Stats { min: self.min, max: self.max, mean: self.new_m, std: variance.sqrt() }
    }
}

/// Per-(symbol,event) running mean/variance/bounds, with `all_symbols`
/// maintained automatically alongside every symbol-specific entry.
#[derive(Default)]
pub struct Statistics {
    running: HashMap<Symbol, HashMap<Event, Welford>>,
    finalized: HashMap<Symbol, HashMap<Event, Stats>>,
    modified: bool,
}

impl Statistics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` to the running stats for both `(symbol, event)` and
    /// `(all_symbols, event)`.
    pub fn add(&mut self, event: &Event, value: i64, symbol: &Symbol) {
        self.modified = true;
        let value = value as f64;
        for target_symbol in [ALL_SYMBOLS.to_string(), symbol.clone()] {
            let per_event = self.running.entry(target_symbol).or_default();
            per_event.entry(event.clone()).and_modify(|w| w.add(value)).or_insert_with(|| Welford::first(value));
        }
    }

    /// Computes closed-form stats for every tracked (symbol, event) from the
    /// running totals so far.
    pub fn finalize(&mut self) {
        for (symbol, per_event) in &self.running {
            let out = self.finalized.entry(symbol.clone()).or_default();
            for (event, w) in per_event {
                out.insert(event.clone(), w.finalize(symbol, event));
            }
        }
    }

    pub fn bounds(&self, event: &Event, symbol: &Symbol) -> Result<(i64, i64), EngineError> {
        let stats = self.get(symbol, event)?;
        Ok((stats.min as i64, stats.max as i64))
    }

    pub fn mean(&self, event: &Event, symbol: &Symbol) -> Result<f64, EngineError> {
        Ok(self.get(symbol, event)?.mean)
    }

    pub fn std(&self, event: &Event, symbol: &Symbol) -> Result<f64, EngineError> {
        Ok(self.get(symbol, event)?.std)
    }

    fn get(&self, symbol: &Symbol, event: &Event) -> Result<&Stats, EngineError> {
        self.finalized
            .get(symbol)
            .and_then(|m| m.get(event))
            .ok_or_else(|| EngineError::DataNotFound(format!("no statistics for symbol '{symbol}' and event '{event}'")))
    }

    /// Symbols with tracked statistics, excluding the synthetic `all_symbols`
    /// bucket, sorted for reproducible iteration.
    #[must_use]
    pub fn get_unique_symbols(&self, include_runtime: bool) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self
            .running
            .keys()
            .filter(|s| s.as_str() != ALL_SYMBOLS)
            .filter(|s| include_runtime || s.as_str() != RUNTIME_SYMBOL)
            .cloned()
            .collect();
        symbols.sort();
        symbols
    }

    /// Loads running state from a CSV previously written by [`Statistics::save`].
    /// A duplicate `(symbol, event)` row is a hard error.
    pub fn load(&mut self, path: &Path) -> Result<(), EngineError> {
        if !path.exists() {
            log::debug!("no statistics file at {}, starting empty", path.display());
            return Ok(());
        }

        let file = File::open(path).map_err(|e| EngineError::io(path.display().to_string(), e))?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);

        for result in reader.records() {
            let record = result?;
            if record.len() != 11 {
                return Err(EngineError::InvalidConfig(format!(
                    "expected 11 columns in statistics row, found {}",
                    record.len()
                )));
            }

            let symbol = record[0].to_string();
            let event = record[1].to_string();
            let min: f64 = record[2].parse().map_err(|_| parse_error(&record[2]))?;
            let max: f64 = record[3].parse().map_err(|_| parse_error(&record[3]))?;
            let mean: f64 = record[4].parse().map_err(|_| parse_error(&record[4]))?;
            let std: f64 = record[5].parse().map_err(|_| parse_error(&record[5]))?;
            let n: f64 = record[6].parse().map_err(|_| parse_error(&record[6]))?;
            let old_m: f64 = record[7].parse().map_err(|_| parse_error(&record[7]))?;
            let new_m: f64 = record[8].parse().map_err(|_| parse_error(&record[8]))?;
            let old_s: f64 = record[9].parse().map_err(|_| parse_error(&record[9]))?;
            let new_s: f64 = record[10].parse().map_err(|_| parse_error(&record[10]))?;

            let per_event = self.running.entry(symbol.clone()).or_default();
            if per_event.contains_key(&event) {
                return Err(EngineError::InvalidConfig(format!(
                    "statistics for symbol '{symbol}' and event '{event}' already exist"
                )));
            }
            per_event.insert(event.clone(), Welford { n, old_m, new_m, old_s, new_s, min, max });

            self.finalized.entry(symbol).or_default().insert(event, Stats { min, max, mean, std });
        }

        Ok(())
    }

    /// Saves running + finalized state to `path`, no-op if nothing changed
    /// since load/construction.
    pub fn save(&mut self, path: &Path) -> Result<(), EngineError> {
        if !self.modified {
            return Ok(());
        }
        self.finalize();

        log::debug!("saving statistics to {}", path.display());
        let file = File::create(path).map_err(|e| EngineError::io(path.display().to_string(), e))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(CSV_HEADER)?;

        for (symbol, per_event) in &self.running {
            for (event, w) in per_event {
                let stats = self.finalized.get(symbol).and_then(|m| m.get(event)).copied().unwrap_or_else(|| w.finalize(symbol, event));
                writer.write_record(&[
                    symbol.clone(),
                    event.clone(),
                    stats.min.to_string(),
                    stats.max.to_string(),
                    stats.mean.to_string(),
                    stats.std.to_string(),
                    w.n.to_string(),
                    w.old_m.to_string(),
                    w.new_m.to_string(),
                    w.old_s.to_string(),
                    w.new_s.to_string(),
                ])?;
            }
        }

        writer.flush().map_err(|e| EngineError::io(path.display().to_string(), e.into()))?;
        Ok(())
    }
}

fn parse_error(field: &str) -> EngineError {
    EngineError::InvalidConfig(format!("could not parse '{field}' as a number in statistics row"))
}

/// Stats computed directly from a sample vector, bypassing the running
/// accumulator. Grounded on `statistics.cpp`'s `calculate_stats_from_values`.
pub fn stats_from_values(mut values: Vec<f64>) -> Result<Stats, EngineError> {
    if values.is_empty() {
        return Err(EngineError::PreconditionViolated("cannot calculate stats from an empty value vector".into()));
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = values.len() as f64;
    let min = values[0];
    let max = values[values.len() - 1];
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    Ok(Stats { min, max, mean, std: variance.sqrt() })
}

/// Median of a sample vector. Grounded on `calculate_median_from_values`.
pub fn median_from_values(mut values: Vec<f64>) -> Result<f64, EngineError> {
    if values.is_empty() {
        return Err(EngineError::PreconditionViolated("cannot calculate median from an empty value vector".into()));
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = values.len();
    if n % 2 == 0 {
        Ok((values[n / 2 - 1] + values[n / 2]) / 2.0)
    } else {
        Ok(values[n / 2])
    }
}

/// Weighted geometric mean `exp(sum(w_i * ln(s_i)) / sum(w_i))`. Grounded on
/// `calculate_weighted_geometric_mean`, computed via log-sum instead of a
/// direct product-of-powers to avoid overflow for large sample counts.
#[must_use]
pub fn weighted_geometric_mean(samples: &[f64], weights: &[f64]) -> f64 {
    let weighted_log_sum: f64 = samples.iter().zip(weights.iter()).map(|(s, w)| w * s.ln()).sum();
    let weight_sum: f64 = weights.iter().sum();
    (weighted_log_sum / weight_sum).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_finalize_matches_manual_mean() {
        let mut stats = Statistics::new();
        let event = "cycles".to_string();
        let symbol = "foo".to_string();
        for v in [10, 20, 30] {
            stats.add(&event, v, &symbol);
        }
        stats.finalize();
        assert!((stats.mean(&event, &symbol).unwrap() - 20.0).abs() < 1e-9);
        assert_eq!(stats.bounds(&event, &symbol).unwrap(), (10, 30));
    }

    #[test]
    fn single_sample_has_zero_std_and_mean_equal_to_min() {
        let mut stats = Statistics::new();
        let event = "cycles".to_string();
        let symbol = "foo".to_string();
        stats.add(&event, 42, &symbol);
        stats.finalize();
        assert_eq!(stats.std(&event, &symbol).unwrap(), 0.0);
        assert_eq!(stats.mean(&event, &symbol).unwrap(), 42.0);
    }

    #[test]
    fn missing_statistic_is_data_not_found() {
        let stats = Statistics::new();
        let err = stats.mean(&"cycles".to_string(), &"foo".to_string()).unwrap_err();
        assert!(matches!(err, EngineError::DataNotFound(_)));
    }

    #[test]
    fn save_then_load_round_trips_bounds_mean_std() {
        let mut stats = Statistics::new();
        let event = "cycles".to_string();
        let symbol = "foo".to_string();
        for v in [1, 2, 3, 4, 5] {
            stats.add(&event, v, &symbol);
        }
        stats.finalize();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.csv");
        stats.save(&path).unwrap();

        let mut loaded = Statistics::new();
        loaded.load(&path).unwrap();

        assert_eq!(loaded.bounds(&event, &symbol).unwrap(), stats.bounds(&event, &symbol).unwrap());
        assert!((loaded.mean(&event, &symbol).unwrap() - stats.mean(&event, &symbol).unwrap()).abs() < 1e-9);
        assert!((loaded.std(&event, &symbol).unwrap() - stats.std(&event, &symbol).unwrap()).abs() < 1e-9);
    }

    #[test]
    fn loading_duplicate_symbol_event_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.csv");
        std::fs::write(
            &path,
            "symbol,event,minimum,maximum,mean,std,n,old_m,new_m,old_s,new_s\n\
             foo,cycles,1,1,1,0,1,1,1,0,0\n\
             foo,cycles,2,2,2,0,1,2,2,0,0\n",
        )
        .unwrap();

        let mut loaded = Statistics::new();
        let err = loaded.load(&path).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn weighted_geometric_mean_of_equal_samples_is_the_sample() {
        let gmean = weighted_geometric_mean(&[2.0, 2.0, 2.0], &[1.0, 1.0, 1.0]);
        assert!((gmean - 2.0).abs() < 1e-9);
    }

    #[test]
    fn median_of_even_length_averages_middle_pair() {
        assert!((median_from_values(vec![1.0, 2.0, 3.0, 4.0]).unwrap() - 2.5).abs() < 1e-9);
    }
}
