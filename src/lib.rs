pub mod analysis;
pub mod cli;
pub mod combination;
pub mod domain;
pub mod external;
pub mod orchestrator;
pub mod profile;
pub mod reference_cache;
pub mod sequence;
pub mod statistics;
pub mod target;
