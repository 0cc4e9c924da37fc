//! Execution profile store
//!
//! Instances are owned in an arena (`Vec<Instance>`) inside their containing
//! profile and referenced elsewhere by [`InstanceId`], the Rust-native
//! substitute for the source's `shared_ptr<Instance>` graph (see
//! `DESIGN.md`). Symbol buckets use a `BTreeMap` to match the source's
//! `std::map<Symbol, ...>` iteration order (alphabetical by symbol).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::Write as _;
use std::path::Path;

use crate::domain::errors::EngineError;
use crate::domain::types::{normalize, CpuId, Event, Label, Symbol};

/// Index into an [`ExecutionProfile`]'s instance arena.
pub type InstanceId = u32;

/// A single recorded execution of a code region.
#[derive(Debug, Clone)]
pub struct Instance {
    pub symbol: Symbol,
    pub label: Label,
    pub cpu: CpuId,
    pub start: u64,
    pub end: u64,
    pub is_gpu_eligible: bool,
    pub event_values: HashMap<Event, i64>,
}

impl Instance {
    pub fn new(symbol: Symbol, label: Label, cpu: CpuId, start: u64, end: u64, is_gpu_eligible: bool) -> Result<Self, EngineError> {
        if end < start {
            return Err(EngineError::PreconditionViolated(format!(
                "instance end ({end}) precedes start ({start}) for symbol '{symbol}'"
            )));
        }
        Ok(Instance { symbol, label, cpu, start, end, is_gpu_eligible, event_values: HashMap::new() })
    }

    #[must_use]
    pub fn get_event_value(&self, event: &Event) -> Option<i64> {
        if event == "gpu_eligible" {
            return Some(i64::from(self.is_gpu_eligible));
        }
        self.event_values.get(event).copied()
    }

    pub fn set_event_value(&mut self, event: Event, value: i64) {
        self.event_values.insert(normalize(&event), value);
    }
}

/// A container of instances grouped by symbol, plus the event-name set and an
/// optional instance-dependency DAG.
#[derive(Default)]
pub struct ExecutionProfile {
    tracefile: Option<String>,
    benchmark: Option<String>,
    arena: Vec<Instance>,
    by_symbol: BTreeMap<Symbol, Vec<InstanceId>>,
    events: Vec<Event>,
    filtered_events: Option<Vec<Event>>,
    /// consumer -> (producers, consumers-of-consumer is tracked on the producer side)
    producers_of: HashMap<InstanceId, HashSet<InstanceId>>,
    consumers_of: HashMap<InstanceId, HashSet<InstanceId>>,
}

impl ExecutionProfile {
    #[must_use]
    pub fn new(tracefile: Option<String>, benchmark: Option<String>, filtered_events: Option<Vec<Event>>) -> Self {
        ExecutionProfile { tracefile, benchmark, filtered_events, ..Default::default() }
    }

    #[must_use]
    pub fn tracefile(&self) -> Option<&str> {
        self.tracefile.as_deref()
    }

    #[must_use]
    pub fn benchmark(&self) -> Option<&str> {
        self.benchmark.as_deref()
    }

    pub fn set_benchmark(&mut self, benchmark: String) {
        self.benchmark = Some(benchmark);
    }

    pub fn set_filtered_events(&mut self, filter: Vec<Event>) {
        self.filtered_events = Some(filter);
    }

    #[must_use]
    pub fn filtered_events(&self) -> Option<&[Event]> {
        self.filtered_events.as_deref()
    }

    #[must_use]
    pub fn instance(&self, id: InstanceId) -> &Instance {
        &self.arena[id as usize]
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> &mut Instance {
        &mut self.arena[id as usize]
    }

    /// Appends `instance` to its symbol bucket, returning its arena id.
    pub fn add_instance(&mut self, instance: Instance) -> InstanceId {
        let id = self.arena.len() as InstanceId;
        let symbol = instance.symbol.clone();
        self.arena.push(instance);
        self.by_symbol.entry(symbol).or_default().push(id);
        id
    }

    pub fn add_event(&mut self, event: Event) {
        let event = normalize(&event);
        if !self.events.contains(&event) {
            self.events.push(event);
        }
    }

    /// Records a data-dependency edge: `producer` completed before `consumer`
    /// started. Asserted at edge-addition time per the design's DAG
    /// invariant.
    pub fn add_dependency(&mut self, producer: InstanceId, consumer: InstanceId) -> Result<(), EngineError> {
        let producer_end = self.arena[producer as usize].end;
        let consumer_start = self.arena[consumer as usize].start;
        if producer_end >= consumer_start {
            return Err(EngineError::PreconditionViolated(format!(
                "dependency edge violates time order: producer ends at {producer_end}, consumer starts at {consumer_start}"
            )));
        }
        self.producers_of.entry(consumer).or_default().insert(producer);
        self.consumers_of.entry(producer).or_default().insert(consumer);
        Ok(())
    }

    #[must_use]
    pub fn get_unique_symbols(&self, include_runtime: bool) -> Vec<Symbol> {
        self.by_symbol
            .keys()
            .filter(|s| include_runtime || !self.arena_symbol_is_runtime(s))
            .cloned()
            .collect()
    }

    fn arena_symbol_is_runtime(&self, symbol: &str) -> bool {
        symbol == crate::domain::types::RUNTIME_SYMBOL
    }

    #[must_use]
    pub fn get_unique_events(&self) -> &[Event] {
        &self.events
    }

    /// Instances that depend on `instance` (consumers of its output).
    #[must_use]
    pub fn consumers_of(&self, instance: InstanceId) -> Option<&HashSet<InstanceId>> {
        self.consumers_of.get(&instance)
    }

    /// Flat list of instance ids; if `symbols` is empty, every stored
    /// instance (optionally excluding `runtime`).
    #[must_use]
    pub fn get_instances(&self, include_runtime: bool, symbols: &[Symbol]) -> Vec<InstanceId> {
        let mut out = Vec::new();
        for (symbol, ids) in &self.by_symbol {
            if !symbols.is_empty() && !symbols.contains(symbol) {
                continue;
            }
            if !include_runtime && self.arena_symbol_is_runtime(symbol) {
                continue;
            }
            out.extend_from_slice(ids);
        }
        out
    }

    /// One i64 vector per instance, columns matching `events`' order. Fails
    /// if any selected instance lacks one of the requested events.
    pub fn get_value_distribution(
        &self,
        events: &[Event],
        include_runtime: bool,
        symbols: &[Symbol],
    ) -> Result<Vec<Vec<i64>>, EngineError> {
        let mut out = Vec::new();
        for id in self.get_instances(include_runtime, symbols) {
            let instance = self.instance(id);
            let mut row = Vec::with_capacity(events.len());
            for event in events {
                let value = instance.get_event_value(event).ok_or_else(|| {
                    EngineError::DataNotFound(format!(
                        "instance {} (symbol '{}') has no value for event '{}'",
                        instance.label, instance.symbol, event
                    ))
                })?;
                row.push(value);
            }
            out.push(row);
        }
        Ok(out)
    }

    fn sorted_by_label(&self) -> Vec<InstanceId> {
        let mut ids = self.get_instances(true, &[]);
        ids.sort_by(|a, b| self.instance(*a).label.dfs_cmp(&self.instance(*b).label));
        ids
    }

    /// Writes `cpu,symbol,label[,gpu_eligible],<events...>`, rows ordered by
    /// the depth-first label comparator. Missing values print as `unknown`.
    /// When a filter event set is attached, the dumped columns are exactly
    /// that set and `gpu_eligible` is omitted.
    pub fn print_to_file(&self, path: &Path) -> Result<(), EngineError> {
        let file = File::create(path).map_err(|e| EngineError::io(path.display().to_string(), e))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

        let (columns, filtered): (&[Event], bool) =
            if let Some(filter) = &self.filtered_events { (filter, true) } else { (&self.events, false) };

        let mut header = vec!["cpu".to_string(), "symbol".to_string(), "label".to_string()];
        if !filtered {
            header.push("gpu_eligible".to_string());
        }
        header.extend(columns.iter().cloned());
        writer.write_record(&header)?;

        for id in self.sorted_by_label() {
            let instance = self.instance(id);
            let mut row = vec![instance.cpu.0.to_string(), instance.symbol.clone(), instance.label.to_string()];
            if !filtered {
                row.push(instance.is_gpu_eligible.to_string());
            }
            for event in columns {
                match instance.get_event_value(event) {
                    Some(value) => row.push(value.to_string()),
                    None => row.push("unknown".to_string()),
                }
            }
            writer.write_record(&row)?;
        }

        writer.flush().map_err(|e| EngineError::io(path.display().to_string(), e.into()))?;
        Ok(())
    }

    /// Reloads a profile previously written by [`Self::print_to_file`] — the
    /// inverse operation, used to read back a combined profile for later
    /// analysis without re-parsing the originating tracefile. `events` gives
    /// the column order the file was written with.
    pub fn load_from_file(path: &Path, events: &[Event]) -> Result<Self, EngineError> {
        let file = File::open(path).map_err(|e| EngineError::io(path.display().to_string(), e))?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);
        let has_gpu_column = reader.headers()?.iter().any(|h| h == "gpu_eligible");

        let mut profile = ExecutionProfile::new(Some(path.display().to_string()), None, None);
        for event in events {
            profile.add_event(event.clone());
        }

        for result in reader.records() {
            let record = result?;
            let malformed = || EngineError::DataNotFound(format!("malformed row in {}", path.display()));

            let cpu = CpuId(record.get(0).ok_or_else(malformed)?.parse().map_err(|_| malformed())?);
            let symbol = record.get(1).ok_or_else(malformed)?.to_string();
            let label: Label = record.get(2).ok_or_else(malformed)?.parse()?;

            let mut column = 3;
            let is_gpu_eligible = if has_gpu_column {
                let value = record.get(column).ok_or_else(malformed)? == "true";
                column += 1;
                value
            } else {
                false
            };

            let mut instance = Instance::new(symbol, label, cpu, 0, 0, is_gpu_eligible)?;
            for event in events {
                if let Some(raw) = record.get(column) {
                    if raw != "unknown" {
                        if let Ok(value) = raw.parse::<i64>() {
                            instance.set_event_value(event.clone(), value);
                        }
                    }
                }
                column += 1;
            }
            profile.add_instance(instance);
        }

        Ok(profile)
    }

    /// Dense adjacency matrix: instance count, each label, then an N×N
    /// 0/1 matrix where `matrix[consumer][producer] = 1` iff a dependency
    /// edge exists.
    pub fn dump_instance_dependencies(&self, path: &Path) -> Result<(), EngineError> {
        let mut file = File::create(path).map_err(|e| EngineError::io(path.display().to_string(), e))?;
        let ordered = self.sorted_by_label();
        let index_of: HashMap<InstanceId, usize> = ordered.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        writeln!(file, "{}", ordered.len()).map_err(|e| EngineError::io(path.display().to_string(), e))?;
        for id in &ordered {
            writeln!(file, "{}", self.instance(*id).label).map_err(|e| EngineError::io(path.display().to_string(), e))?;
        }

        for consumer_id in &ordered {
            let mut row = vec!["0".to_string(); ordered.len()];
            if let Some(producers) = self.producers_of.get(consumer_id) {
                for producer_id in producers {
                    if let Some(&idx) = index_of.get(producer_id) {
                        row[idx] = "1".to_string();
                    }
                }
            }
            writeln!(file, "{}", row.join(",")).map_err(|e| EngineError::io(path.display().to_string(), e))?;
        }

        Ok(())
    }

    /// GraphViz DOT with the creation tree (solid, from label hierarchy) and
    /// data-dependency edges (dotted). Runtime instances are excluded.
    pub fn dump_instance_dependencies_dot(&self, path: &Path) -> Result<(), EngineError> {
        let mut file = File::create(path).map_err(|e| EngineError::io(path.display().to_string(), e))?;
        writeln!(file, "digraph D {{").map_err(|e| EngineError::io(path.display().to_string(), e))?;

        let ordered = self.sorted_by_label();
        let mut label_to_index: HashMap<String, usize> = HashMap::new();

        for (idx, id) in ordered.iter().enumerate() {
            let instance = self.instance(*id);
            if instance.symbol == crate::domain::types::RUNTIME_SYMBOL {
                continue;
            }
            label_to_index.insert(instance.label.to_string(), idx);
            writeln!(file, "node_{idx} [label=\"{idx}\\n{}\\n{}\"];", instance.label, instance.symbol)
                .map_err(|e| EngineError::io(path.display().to_string(), e))?;
        }

        for (idx, id) in ordered.iter().enumerate() {
            let instance = self.instance(*id);
            if instance.symbol == crate::domain::types::RUNTIME_SYMBOL {
                continue;
            }
            if instance.label.0.len() < 2 {
                continue;
            }
            let mut parent = instance.label.0.clone();
            parent.pop();
            let parent_label = Label(parent).to_string();
            if let Some(&parent_idx) = label_to_index.get(&parent_label) {
                writeln!(file, "node_{parent_idx} -> node_{idx}").map_err(|e| EngineError::io(path.display().to_string(), e))?;
            }
        }

        for (idx, id) in ordered.iter().enumerate() {
            let instance = self.instance(*id);
            if instance.symbol == crate::domain::types::RUNTIME_SYMBOL {
                continue;
            }
            if let Some(producers) = self.producers_of.get(id) {
                for producer_id in producers {
                    if let Some(producer_idx) = ordered.iter().position(|x| x == producer_id) {
                        writeln!(file, "node_{producer_idx} -> node_{idx} [style=dotted, constraint=false];")
                            .map_err(|e| EngineError::io(path.display().to_string(), e))?;
                    }
                }
            }
        }

        writeln!(file, "}}").map_err(|e| EngineError::io(path.display().to_string(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(symbol: &str, label: Vec<i64>, cpu: u32, start: u64, end: u64) -> Instance {
        Instance::new(symbol.to_string(), Label(label), CpuId(cpu), start, end, false).unwrap()
    }

    #[test]
    fn add_instance_groups_by_symbol() {
        let mut profile = ExecutionProfile::new(None, None, None);
        profile.add_instance(instance("foo", vec![0], 0, 0, 10));
        profile.add_instance(instance("bar", vec![1], 0, 0, 10));
        let symbols = profile.get_unique_symbols(true);
        assert_eq!(symbols, vec!["bar".to_string(), "foo".to_string()]);
    }

    #[test]
    fn instance_end_before_start_is_rejected() {
        assert!(Instance::new("foo".to_string(), Label(vec![0]), CpuId(0), 10, 5, false).is_err());
    }

    #[test]
    fn get_value_distribution_errors_on_missing_event() {
        let mut profile = ExecutionProfile::new(None, None, None);
        let mut i = instance("foo", vec![0], 0, 0, 10);
        i.set_event_value("cycles".to_string(), 100);
        profile.add_instance(i);

        let err = profile.get_value_distribution(&["cycles".to_string(), "cache_miss".to_string()], true, &[]).unwrap_err();
        assert!(matches!(err, EngineError::DataNotFound(_)));
    }

    #[test]
    fn print_to_file_emits_unknown_for_missing_values() {
        let mut profile = ExecutionProfile::new(None, None, None);
        profile.add_event("cycles".to_string());
        let mut i = instance("foo", vec![0], 0, 0, 10);
        i.set_event_value("cycles".to_string(), 100);
        profile.add_instance(i);
        profile.add_event("cache_miss".to_string());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.csv");
        profile.print_to_file(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("unknown"));
        assert!(content.contains("100"));
    }

    #[test]
    fn dependency_edge_violating_time_order_is_rejected() {
        let mut profile = ExecutionProfile::new(None, None, None);
        let producer = profile.add_instance(instance("foo", vec![0], 0, 10, 20));
        let consumer = profile.add_instance(instance("foo", vec![1], 0, 0, 5));
        assert!(profile.add_dependency(producer, consumer).is_err());
    }

    #[test]
    fn load_from_file_round_trips_print_to_file() {
        let mut profile = ExecutionProfile::new(None, None, None);
        profile.add_event("cycles".to_string());
        let mut i = instance("foo", vec![0, 1], 2, 0, 10);
        i.set_event_value("cycles".to_string(), 100);
        profile.add_instance(i);
        profile.add_instance(instance("bar", vec![1], 0, 0, 10));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("combined.csv");
        profile.print_to_file(&path).unwrap();

        let reloaded = ExecutionProfile::load_from_file(&path, &["cycles".to_string()]).unwrap();
        let ids = reloaded.get_instances(true, &[]);
        assert_eq!(ids.len(), 2);
        let foo = reloaded.get_instances(true, &["foo".to_string()])[0];
        assert_eq!(reloaded.instance(foo).get_event_value(&"cycles".to_string()), Some(100));
        let bar = reloaded.get_instances(true, &["bar".to_string()])[0];
        assert_eq!(reloaded.instance(bar).get_event_value(&"cycles".to_string()), None);
    }

    #[test]
    fn get_instances_excludes_runtime_when_requested() {
        let mut profile = ExecutionProfile::new(None, None, None);
        profile.add_instance(instance("runtime", vec![-1], 0, 0, 10));
        profile.add_instance(instance("foo", vec![0], 0, 0, 10));
        assert_eq!(profile.get_instances(false, &[]).len(), 1);
        assert_eq!(profile.get_instances(true, &[]).len(), 2);
    }
}
