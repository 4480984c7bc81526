//! Shared runtime for the virtbal daemons.
//!
//! Both balancers are single-threaded periodic control loops with the same
//! shape: snapshot live domain state, decide, commit, sleep. This crate
//! holds the parts that shape shares:
//!
//! - `driver`: the tick loop, its failure budget, and shutdown wiring.
//! - `stats`: mean, deviation, and the dispersion measure the CPU gate uses.
//! - `telemetry`: severity-tagged records over `tracing`.

pub mod driver;
pub mod stats;
pub mod telemetry;

pub use driver::{run, shutdown_signal, Balancer, LoopError, TickError, TickReport, MAX_FAILURES};
pub use telemetry::{record, Severity};
