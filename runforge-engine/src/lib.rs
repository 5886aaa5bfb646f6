//! Runforge Engine
//!
//! Turns a stored training-run specification into a live, monitored OS
//! process and reconciles the truth of "what is actually running" against
//! the persisted record.
//!
//! Architecture:
//! - Configuration: tuning knobs for ports, polling, and timeouts
//! - Store: trait seam to the external document store holding run records
//! - Ports: non-overlapping port-range allocation for concurrent runs
//! - Process: process-group spawn, log redirection, group-wide signaling
//! - Registry: the authoritative in-memory table of active runs
//! - Monitor: one watcher task per active run driving status transitions
//! - Engine: the facade exposing create/execute/stop/restart and friends
//!
//! Everything around the engine (HTTP transport, metadata CRUD, auth) is an
//! external collaborator reached through the [`store::RunStore`] trait.

pub mod command;
pub mod config;
pub mod engine;
pub mod monitor;
pub mod ports;
pub mod process;
pub mod registry;
pub mod store;
pub mod workspace;

pub use crate::config::EngineConfig;
pub use crate::engine::RunEngine;
pub use crate::store::{MemoryRunStore, RunStore};
