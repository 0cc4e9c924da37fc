//! Reference distribution cache
//!
//! Per `(reference_idx, repeat_idx)` a compact little-endian binary file
//! holds every symbol's instance value-vectors for a reference event set, so
//! accuracy analysis never re-parses a tracefile. Grounded on
//! `target.cpp`'s `save_reference_values_to_disk`/`load_reference_distribution`
//! and spec.md §4.6's wire layout.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::domain::errors::EngineError;
use crate::domain::types::{Event, Symbol};

/// One reference set's recorded values, grouped by symbol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceDistribution {
    pub events: Vec<Event>,
    pub values_per_symbol: HashMap<Symbol, Vec<Vec<i64>>>,
}

/// Writes `distribution` to `path` in the wire format:
/// `u32 num_events, (u32 len, bytes)*num_events, u32 num_symbols,
/// (u32 len, bytes, u32 num_instances, num_instances*num_events*i64)*num_symbols`.
pub fn save(path: &Path, distribution: &ReferenceDistribution) -> Result<(), EngineError> {
    let file = File::create(path).map_err(|e| EngineError::io(path.display().to_string(), e))?;
    let mut writer = BufWriter::new(file);

    write_u32(&mut writer, path, distribution.events.len() as u32)?;
    for event in &distribution.events {
        write_string(&mut writer, path, event)?;
    }

    write_u32(&mut writer, path, distribution.values_per_symbol.len() as u32)?;
    for (symbol, rows) in &distribution.values_per_symbol {
        write_string(&mut writer, path, symbol)?;
        write_u32(&mut writer, path, rows.len() as u32)?;
        for row in rows {
            if row.len() != distribution.events.len() {
                return Err(EngineError::PreconditionViolated(format!(
                    "reference row for symbol '{symbol}' has {} values, expected {}",
                    row.len(),
                    distribution.events.len()
                )));
            }
            for value in row {
                writer.write_i64::<LittleEndian>(*value).map_err(|e| EngineError::io(path.display().to_string(), e))?;
            }
        }
    }

    writer.flush().map_err(|e| EngineError::io(path.display().to_string(), e))?;
    Ok(())
}

/// Reads a distribution previously written by [`save`].
pub fn load(path: &Path) -> Result<ReferenceDistribution, EngineError> {
    let file = File::open(path).map_err(|e| EngineError::io(path.display().to_string(), e))?;
    let mut reader = BufReader::new(file);

    let num_events = read_u32(&mut reader, path)?;
    let mut events = Vec::with_capacity(num_events as usize);
    for _ in 0..num_events {
        events.push(read_string(&mut reader, path)?);
    }

    let num_symbols = read_u32(&mut reader, path)?;
    let mut values_per_symbol = HashMap::with_capacity(num_symbols as usize);
    for _ in 0..num_symbols {
        let symbol = read_string(&mut reader, path)?;
        let num_instances = read_u32(&mut reader, path)?;
        let mut rows = Vec::with_capacity(num_instances as usize);
        for _ in 0..num_instances {
            let mut row = Vec::with_capacity(events.len());
            for _ in 0..events.len() {
                row.push(reader.read_i64::<LittleEndian>().map_err(|e| EngineError::io(path.display().to_string(), e))?);
            }
            rows.push(row);
        }
        values_per_symbol.insert(symbol, rows);
    }

    Ok(ReferenceDistribution { events, values_per_symbol })
}

fn write_u32(writer: &mut impl Write, path: &Path, value: u32) -> Result<(), EngineError> {
    writer.write_u32::<LittleEndian>(value).map_err(|e| EngineError::io(path.display().to_string(), e))
}

fn write_string(writer: &mut impl Write, path: &Path, value: &str) -> Result<(), EngineError> {
    write_u32(writer, path, value.len() as u32)?;
    writer.write_all(value.as_bytes()).map_err(|e| EngineError::io(path.display().to_string(), e))
}

fn read_u32(reader: &mut impl Read, path: &Path) -> Result<u32, EngineError> {
    reader.read_u32::<LittleEndian>().map_err(|e| EngineError::io(path.display().to_string(), e))
}

fn read_string(reader: &mut impl Read, path: &Path) -> Result<String, EngineError> {
    let len = read_u32(reader, path)?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).map_err(|e| EngineError::io(path.display().to_string(), e))?;
    String::from_utf8(buf).map_err(|e| EngineError::InvalidConfig(format!("reference cache string was not valid UTF-8: {e}")))
}

/// How eagerly a [`ReferenceCache`] materializes distributions from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Every known `(reference_idx, repeat_idx)` file is loaded up front.
    Eager,
    /// A file is only read the first time it is queried.
    Lazy,
}

/// In-memory cache over the on-disk reference distribution files for one
/// target. `get_or_load_reference_distribution` concatenates instance rows
/// across the requested symbols (empty = all), after locating the reference
/// set that subsumes the requested events.
#[derive(Default)]
pub struct ReferenceCache {
    loaded: HashMap<(u32, u32), ReferenceDistribution>,
    known_files: HashMap<(u32, u32), std::path::PathBuf>,
    mode: Option<LoadMode>,
}

impl ReferenceCache {
    #[must_use]
    pub fn new(mode: LoadMode) -> Self {
        ReferenceCache { mode: Some(mode), ..Default::default() }
    }

    /// Registers the on-disk location for `(reference_idx, repeat_idx)`
    /// without reading it yet (unless the cache is in eager mode).
    pub fn register(&mut self, reference_idx: u32, repeat_idx: u32, path: std::path::PathBuf) -> Result<(), EngineError> {
        if self.mode == Some(LoadMode::Eager) {
            let distribution = load(&path)?;
            self.loaded.insert((reference_idx, repeat_idx), distribution);
        }
        self.known_files.insert((reference_idx, repeat_idx), path);
        Ok(())
    }

    fn ensure_loaded(&mut self, reference_idx: u32, repeat_idx: u32) -> Result<&ReferenceDistribution, EngineError> {
        if !self.loaded.contains_key(&(reference_idx, repeat_idx)) {
            let path = self.known_files.get(&(reference_idx, repeat_idx)).cloned().ok_or_else(|| {
                EngineError::DataNotFound(format!("no reference distribution registered for reference {reference_idx} repeat {repeat_idx}"))
            })?;
            let distribution = load(&path)?;
            self.loaded.insert((reference_idx, repeat_idx), distribution);
        }
        Ok(&self.loaded[&(reference_idx, repeat_idx)])
    }

    /// Value rows across `symbols` (or every symbol if empty) for the
    /// distribution whose recorded event set is a superset of `events`, in
    /// the column order of `events`.
    pub fn get_or_load_reference_distribution(
        &mut self,
        events: &[Event],
        reference_idx: u32,
        repeat_idx: u32,
        symbols: &[Symbol],
    ) -> Result<Vec<Vec<i64>>, EngineError> {
        let distribution = self.ensure_loaded(reference_idx, repeat_idx)?;

        if !events.iter().all(|e| distribution.events.contains(e)) {
            return Err(EngineError::DataNotFound(format!(
                "reference {reference_idx} repeat {repeat_idx} does not cover events {events:?}"
            )));
        }

        let column_indexes: Vec<usize> = events.iter().map(|e| distribution.events.iter().position(|x| x == e).unwrap()).collect();

        let mut out = Vec::new();
        for (symbol, rows) in &distribution.values_per_symbol {
            if !symbols.is_empty() && !symbols.contains(symbol) {
                continue;
            }
            for row in rows {
                out.push(column_indexes.iter().map(|&idx| row[idx]).collect());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_distribution() -> ReferenceDistribution {
        let mut values_per_symbol = HashMap::new();
        values_per_symbol.insert("foo".to_string(), vec![vec![1, 2], vec![3, 4]]);
        ReferenceDistribution { events: vec!["cycles".to_string(), "instructions".to_string()], values_per_symbol }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.bin");
        let distribution = sample_distribution();
        save(&path, &distribution).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, distribution);
    }

    #[test]
    fn mismatched_row_width_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        let mut values_per_symbol = HashMap::new();
        values_per_symbol.insert("foo".to_string(), vec![vec![1]]);
        let distribution = ReferenceDistribution { events: vec!["a".to_string(), "b".to_string()], values_per_symbol };
        assert!(save(&path, &distribution).is_err());
    }

    #[test]
    fn lazy_cache_loads_on_first_query() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.bin");
        save(&path, &sample_distribution()).unwrap();

        let mut cache = ReferenceCache::new(LoadMode::Lazy);
        cache.register(0, 0, path).unwrap();
        assert!(cache.loaded.is_empty());

        let rows = cache.get_or_load_reference_distribution(&["cycles".to_string()], 0, 0, &[]).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!cache.loaded.is_empty());
    }

    #[test]
    fn eager_cache_loads_at_registration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.bin");
        save(&path, &sample_distribution()).unwrap();

        let mut cache = ReferenceCache::new(LoadMode::Eager);
        cache.register(0, 0, path).unwrap();
        assert!(!cache.loaded.is_empty());
    }

    #[test]
    fn querying_unregistered_reference_is_data_not_found() {
        let mut cache = ReferenceCache::new(LoadMode::Lazy);
        let err = cache.get_or_load_reference_distribution(&["cycles".to_string()], 0, 0, &[]).unwrap_err();
        assert!(matches!(err, EngineError::DataNotFound(_)));
    }
}
