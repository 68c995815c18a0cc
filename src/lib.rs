//! Library crate for fanout exposing the expansion, scheduling and telemetry modules.
pub mod error;
pub mod exec;
pub mod expand;
pub mod logging;
pub mod progress;
pub mod results;
pub mod scheduler;
pub mod telemetry;
pub mod types;
