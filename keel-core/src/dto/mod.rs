//! Data Transfer Objects for live observers
//!
//! Payloads published by the engine while an execution is in flight.
//! Observers subscribe per execution id and receive either full state
//! snapshots or individual log lines.

pub mod notification;
