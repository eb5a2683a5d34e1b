//! pollster-core
//!
//! Polling agent for a distributed task-execution platform: pulls task ids
//! from a queue, competes with other agents for each task through
//! conditional updates, runs the task on a co-located worker and records the
//! outcome.
//!
//! # Modules
//! - **domain**: records, statuses, the acquisition decision table, errors
//! - **ports**: store, queue, storage, worker and checker traits
//! - **app**: acquisition, task handler, agent loop, builder
//! - **impls**: in-memory adapters for development and tests
//! - **config**: `AgentConfig`

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{Agent, AgentBuilder, AgentExit};
pub use config::AgentConfig;
