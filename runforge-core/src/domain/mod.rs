//! Core domain types
//!
//! This module contains the domain structures shared between the engine
//! (which executes and monitors runs) and whatever persists them. The run
//! record mirrors what the external document store holds; the engine only
//! ever reads the immutable snapshot and patches the mutable execution state.

pub mod run;
