//! External, out-of-process collaborators
//!
//! The engine never profiles hardware or parses tracefiles itself; both are
//! modeled as traits so the orchestrator is testable without real counters.
//! No production implementation ships (genuinely out of scope); only test
//! doubles live under `#[cfg(test)]`.

use std::path::Path;

use crate::domain::errors::EngineError;
use crate::domain::types::{Event, Runtime};
use crate::profile::ExecutionProfile;

/// Drives an external hardware-counter profiler for one execution.
pub trait Profiler {
    /// Runs `binary args` under `runtime`'s instrumentation, recording
    /// `event_set` into `tracefile`. `clear_cache` drops the OS page cache
    /// first; `multiplex` allows more events than physical counters via
    /// time-division (a HEM run).
    fn execute(
        &self,
        runtime: Runtime,
        binary: &Path,
        args: &str,
        tracefile: &Path,
        event_set: &[Event],
        clear_cache: bool,
        multiplex: bool,
    ) -> Result<(), EngineError>;

    /// Static check of whether `event_set` can be monitored simultaneously
    /// on the hardware described by `papi_directory`, without running
    /// anything.
    fn compatibility_check(&self, event_set: &[Event], papi_directory: &Path) -> bool;
}

/// Parses a tracefile produced by a [`Profiler`] run into an in-memory
/// [`ExecutionProfile`].
pub trait TraceParser {
    /// Populates instances with `symbol`, `label`, `cpu`, `start`, `end`,
    /// `is_gpu_eligible` and `event_values`, and synthesizes one `runtime`
    /// instance per CPU. Dependency edges are only reconstructed when
    /// `load_comm_matrix` is set.
    fn parse_trace(&self, tracefile: &Path, runtime: Runtime, load_comm_matrix: bool) -> Result<ExecutionProfile, EngineError>;
}

#[cfg(test)]
pub mod fixtures {
    use super::{EngineError, Event, ExecutionProfile, Path, Profiler, Runtime, TraceParser};
    use std::cell::RefCell;
    use std::collections::HashMap;

    use crate::domain::types::{CpuId, Label};
    use crate::profile::Instance;

    /// Records every call it receives and always succeeds, writing an empty
    /// marker file so callers that check `tracefile.exists()` are satisfied.
    #[derive(Default)]
    pub struct RecordingProfiler {
        pub calls: RefCell<Vec<(Vec<Event>, std::path::PathBuf)>>,
        pub compatible_event_limit: usize,
    }

    impl Profiler for RecordingProfiler {
        fn execute(
            &self,
            _runtime: Runtime,
            _binary: &Path,
            _args: &str,
            tracefile: &Path,
            event_set: &[Event],
            _clear_cache: bool,
            _multiplex: bool,
        ) -> Result<(), EngineError> {
            std::fs::write(tracefile, b"").map_err(|e| EngineError::io(tracefile.display().to_string(), e))?;
            self.calls.borrow_mut().push((event_set.to_vec(), tracefile.to_path_buf()));
            Ok(())
        }

        fn compatibility_check(&self, event_set: &[Event], _papi_directory: &Path) -> bool {
            self.compatible_event_limit == 0 || event_set.len() <= self.compatible_event_limit
        }
    }

    /// One fixture instance: symbol, start, end and its recorded event values.
    pub type FixtureRow = (String, i64, i64, HashMap<String, i64>);

    /// Returns a fixed, pre-canned profile for every tracefile, regardless of
    /// its contents, keyed by an in-memory map a test populates up front.
    #[derive(Default)]
    pub struct FixedTraceParser {
        pub profiles_by_tracefile: HashMap<std::path::PathBuf, Vec<FixtureRow>>,
    }

    impl TraceParser for FixedTraceParser {
        fn parse_trace(&self, tracefile: &Path, _runtime: Runtime, _load_comm_matrix: bool) -> Result<ExecutionProfile, EngineError> {
            let mut profile = ExecutionProfile::new(Some(tracefile.display().to_string()), None, None);
            let rows = self.profiles_by_tracefile.get(tracefile).ok_or_else(|| {
                EngineError::DataNotFound(format!("no fixture profile registered for tracefile {}", tracefile.display()))
            })?;

            for (idx, (symbol, start, end, event_values)) in rows.iter().enumerate() {
                #[allow(clippy::cast_possible_wrap)]
                let label = Label(vec![idx as i64]);
                #[allow(clippy::cast_sign_loss)]
                let mut instance = Instance::new(symbol.clone(), label, CpuId(0), *start as u64, *end as u64, false)?;
                for (event, value) in event_values {
                    instance.set_event_value(event.clone(), *value);
                    profile.add_event(event.clone());
                }
                profile.add_instance(instance);
            }
            Ok(profile)
        }
    }
}
