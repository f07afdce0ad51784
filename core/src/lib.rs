//! fraudscan-core: windowed fraud detection over administrative claims.
//!
//! Window Resolver → Record Source → Rule Evaluator → Aggregator →
//! Report Writer, sequenced by the Run Orchestrator.

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod demo;
pub mod error;
pub mod evaluator;
pub mod finding;
pub mod orchestrator;
pub mod record;
pub mod report;
pub mod rng;
pub mod rules;
pub mod run_result;
pub mod source;
pub mod store;
pub mod types;
pub mod window;
