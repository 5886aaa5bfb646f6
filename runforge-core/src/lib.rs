//! Runforge Core
//!
//! Core types for the Runforge run-execution engine.
//!
//! This crate contains:
//! - Domain types: the run record, its status machine, and the trainer flag bag
//! - The engine error taxonomy shared by every engine operation

pub mod domain;
pub mod error;
