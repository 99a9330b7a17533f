//! runway run engine.
//!
//! The execution core of the runway task platform: environment-scoped run
//! queues behind a shared master queue, a resource-budgeted dequeue
//! scheduler, per-run distributed locks, and waitpoints that suspend a run
//! until an external event or another run supplies a result.
//!
//! The crate ships the `run-engine` binary (HTTP API plus background
//! workers) and exposes the library surface for embedding and integration
//! tests.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod lock;
pub mod machines;
pub mod model;
pub mod payload;
pub mod queue;
pub mod repository;
pub mod state;
pub mod waitpoints;
pub mod worker;

pub use engine::{EngineOptions, RunEngine};
pub use error::{EngineError, EngineResult};
