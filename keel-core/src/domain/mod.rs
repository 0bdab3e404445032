//! Core domain types
//!
//! These types are shared between the engine (which drives executions) and
//! the store (which persists them).

pub mod execution;
pub mod source;
