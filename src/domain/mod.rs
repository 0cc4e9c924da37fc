//! Domain model for the fusion engine
//!
//! Core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod config;
pub mod errors;
pub mod types;

pub use types::{
    normalize, AccuracyMetric, CpuId, Event, Label, Runtime, Strategy, Symbol, ALL_SYMBOLS, RUNTIME_SYMBOL,
};

pub use config::EngineConfig;
pub use errors::EngineError;
