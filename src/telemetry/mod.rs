//! Live TCP telemetry for batches of `scp` transfers.
pub mod diag;
pub mod monitor;
pub mod transfer;
