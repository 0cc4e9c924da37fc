//! Domain types providing compile-time safety and self-documentation
//!
//! Newtype wrappers and small value types shared across the engine. `Event`
//! and `Symbol` stay plain `String`s (the source treats them as such
//! throughout, and every module needs to hash/compare/serialize them freely).

use std::fmt;

/// A hardware counter or derived scalar observation, always lowercase.
pub type Event = String;

/// The name of a code region. `"runtime"` and `"all_symbols"` are reserved.
pub type Symbol = String;

pub const RUNTIME_SYMBOL: &str = "runtime";
pub const ALL_SYMBOLS: &str = "all_symbols";

/// Lowercases an event or symbol name on ingestion, matching the source's
/// normalization of every event identifier to lowercase.
#[must_use]
pub fn normalize(name: &str) -> String {
    name.to_lowercase()
}

/// A worker/CPU id that an instance executed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Position in the creation tree: top-level rank, child rank, and so on.
///
/// A single negative element identifies a runtime instance on that CPU
/// (`{-cpu-1}`, i.e. `Label(vec![-(cpu as i64) - 1])`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label(pub Vec<i64>);

impl Label {
    #[must_use]
    pub fn is_runtime(&self) -> bool {
        self.0.len() == 1 && self.0[0] < 0
    }

    /// Depth-first comparator: position-by-position signed comparison, with
    /// a shorter vector ranking "less" once the overlapping positions are
    /// equal, and negative-leading-component (runtime) labels grouped first
    /// in ascending `|cpu|` order.
    #[must_use]
    pub fn dfs_cmp(&self, other: &Label) -> std::cmp::Ordering {
        use std::cmp::Ordering;

        match (self.is_runtime(), other.is_runtime()) {
            (true, true) => self.0[0].abs().cmp(&other.0[0].abs()),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => {
                for (a, b) in self.0.iter().zip(other.0.iter()) {
                    match a.cmp(b) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }
                self.0.len().cmp(&other.0.len())
            }
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join("-"))
    }
}

impl std::str::FromStr for Label {
    type Err = crate::domain::errors::EngineError;

    /// Inverse of `Display`. A runtime label's single component is already
    /// negative, so it's tried whole first; multi-component labels are
    /// always non-negative creation-tree ranks and split cleanly on `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = s.parse::<i64>() {
            return Ok(Label(vec![n]));
        }
        s.split('-')
            .map(str::parse::<i64>)
            .collect::<Result<Vec<i64>, _>>()
            .map(Label)
            .map_err(|_| crate::domain::errors::EngineError::DataNotFound(format!("malformed label '{s}'")))
    }
}

/// Instrumented runtime the target binary was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Runtime {
    OpenStream,
    OpenMp,
}

impl Runtime {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Runtime::OpenStream => "openstream",
            Runtime::OpenMp => "openmp",
        }
    }
}

impl std::str::FromStr for Runtime {
    type Err = crate::domain::errors::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openstream" => Ok(Runtime::OpenStream),
            "openmp" => Ok(Runtime::OpenMp),
            other => Err(crate::domain::errors::EngineError::InvalidConfig(format!(
                "runtime '{other}' is not supported, expected 'openstream' or 'openmp'"
            ))),
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The closed set of instance-matching/fusion strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Strategy {
    Random,
    RandomMinimal,
    RandomTt,
    RandomTtMinimal,
    Ctc,
    CtcMinimal,
    Lgl,
    LglMinimal,
    Bc,
    Hem,
}

impl Strategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Random => "random",
            Strategy::RandomMinimal => "random_minimal",
            Strategy::RandomTt => "random_tt",
            Strategy::RandomTtMinimal => "random_tt_minimal",
            Strategy::Ctc => "ctc",
            Strategy::CtcMinimal => "ctc_minimal",
            Strategy::Lgl => "lgl",
            Strategy::LglMinimal => "lgl_minimal",
            Strategy::Bc => "bc",
            Strategy::Hem => "hem",
        }
    }

    /// Parses a bare strategy name together with a `minimal` flag, the way
    /// the CLI's `--strategies`/`--minimal` combination resolves one.
    pub fn from_name_and_minimal(name: &str, minimal: bool) -> Result<Self, crate::domain::errors::EngineError> {
        use crate::domain::errors::EngineError;
        Ok(match (name, minimal) {
            ("random", false) => Strategy::Random,
            ("random", true) => Strategy::RandomMinimal,
            ("random_tt", false) => Strategy::RandomTt,
            ("random_tt", true) => Strategy::RandomTtMinimal,
            ("ctc", false) => Strategy::Ctc,
            ("ctc", true) => Strategy::CtcMinimal,
            ("lgl", false) => Strategy::Lgl,
            ("lgl", true) => Strategy::LglMinimal,
            ("bc", false) => Strategy::Bc,
            ("bc", true) => {
                return Err(EngineError::InvalidConfig(
                    "combination strategy bc cannot be performed with minimal profiles".into(),
                ))
            }
            ("hem", false) => Strategy::Hem,
            ("hem", true) => {
                return Err(EngineError::InvalidConfig(
                    "combination strategy hem cannot be performed with minimal profiles".into(),
                ))
            }
            (other, _) => {
                return Err(EngineError::InvalidConfig(format!(
                    "could not resolve strategy '{other}' to a supported combination strategy"
                )))
            }
        })
    }

    /// True for the strategies that operate per-symbol rather than treating
    /// every profiled instance as one "all" bucket.
    #[must_use]
    pub fn is_per_symbol(self) -> bool {
        matches!(
            self,
            Strategy::RandomTt | Strategy::RandomTtMinimal | Strategy::Ctc | Strategy::CtcMinimal | Strategy::Bc
        )
    }

}

impl std::str::FromStr for Strategy {
    type Err = crate::domain::errors::EngineError;

    /// Parses a strategy's full name (as produced by `as_str`), e.g. for
    /// the combined-profile registry persisted in `fuse.json`. Distinct
    /// from `from_name_and_minimal`, which parses a bare name plus a
    /// separate `minimal` flag for the CLI.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "random" => Strategy::Random,
            "random_minimal" => Strategy::RandomMinimal,
            "random_tt" => Strategy::RandomTt,
            "random_tt_minimal" => Strategy::RandomTtMinimal,
            "ctc" => Strategy::Ctc,
            "ctc_minimal" => Strategy::CtcMinimal,
            "lgl" => Strategy::Lgl,
            "lgl_minimal" => Strategy::LglMinimal,
            "bc" => Strategy::Bc,
            "hem" => Strategy::Hem,
            other => {
                return Err(crate::domain::errors::EngineError::InvalidConfig(format!(
                    "could not resolve strategy '{other}' to a supported combination strategy"
                )))
            }
        })
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Accuracy aggregation metric selected for `analyse_sequence_combinations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccuracyMetric {
    Epd,
    EpdTt,
    Spearmans,
}

impl std::str::FromStr for AccuracyMetric {
    type Err = crate::domain::errors::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "epd" => Ok(AccuracyMetric::Epd),
            "epd_tt" => Ok(AccuracyMetric::EpdTt),
            "spearmans" => Ok(AccuracyMetric::Spearmans),
            other => Err(crate::domain::errors::EngineError::InvalidConfig(format!(
                "could not resolve metric '{other}' to a supported accuracy metric"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_dfs_orders_shorter_as_less_when_prefix_equal() {
        let a = Label(vec![0, 1]);
        let b = Label(vec![0, 1, 0]);
        assert_eq!(a.dfs_cmp(&b), std::cmp::Ordering::Less);
    }

    #[test]
    fn label_dfs_groups_runtime_labels_first_by_magnitude() {
        let rt0 = Label(vec![-1]);
        let rt1 = Label(vec![-2]);
        let normal = Label(vec![0]);
        assert_eq!(rt0.dfs_cmp(&rt1), std::cmp::Ordering::Less);
        assert_eq!(rt0.dfs_cmp(&normal), std::cmp::Ordering::Less);
        assert_eq!(normal.dfs_cmp(&rt0), std::cmp::Ordering::Greater);
    }

    #[test]
    fn label_round_trips_through_display() {
        for label in [Label(vec![0, 1, 2]), Label(vec![-3]), Label(vec![0])] {
            let parsed: Label = label.to_string().parse().unwrap();
            assert_eq!(parsed, label);
        }
    }

    #[test]
    fn strategy_round_trips_through_name() {
        assert_eq!(Strategy::from_name_and_minimal("ctc", false).unwrap(), Strategy::Ctc);
        assert_eq!(Strategy::from_name_and_minimal("ctc", true).unwrap(), Strategy::CtcMinimal);
        assert!(Strategy::from_name_and_minimal("bc", true).is_err());
    }

    #[test]
    fn runtime_parses_from_str() {
        assert_eq!("openmp".parse::<Runtime>().unwrap(), Runtime::OpenMp);
        assert!("weird".parse::<Runtime>().is_err());
    }
}
