//! Engine-wide configuration
//!
//! Replaces the source's mutable global config block with one immutable
//! record, built once from CLI flags/defaults and passed by reference into
//! the constructors that need it.

use crate::reference_cache::LoadMode;

/// Numeric/behavioral knobs shared across the orchestrator and sequence
/// generator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempts the external profiler is retried before giving up.
    pub max_execution_attempts: u32,
    /// Bins-per-dimension used when building TMD signatures.
    pub tmd_bin_count: u32,
    /// Whether reference distributions load lazily or eagerly.
    pub lazy_load_references: bool,
    /// Whether aggregate metrics weight per-pair TMDs by instance count.
    pub weighted_tmd: bool,
    /// Whether accuracy is additionally broken down per work function.
    pub calculate_per_workfunction_tmds: bool,
}

impl EngineConfig {
    #[must_use]
    pub fn load_mode(&self) -> LoadMode {
        if self.lazy_load_references {
            LoadMode::Lazy
        } else {
            LoadMode::Eager
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_execution_attempts: 3,
            tmd_bin_count: 100,
            lazy_load_references: true,
            weighted_tmd: true,
            calculate_per_workfunction_tmds: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_lazy_loading() {
        let config = EngineConfig::default();
        assert_eq!(config.load_mode(), LoadMode::Lazy);
    }
}
