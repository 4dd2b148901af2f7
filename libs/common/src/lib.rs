//! Common utilities shared across the innominatus orchestration core.
//!
//! Telemetry bootstrap and the shared shutdown signal; configuration
//! loading lives in `innominatus_orchestrator::config` since the
//! recognized options are specific to the engine.

pub mod shutdown;
pub mod telemetry;

pub use telemetry::init_tracing;
