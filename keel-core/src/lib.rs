//! Keel Core
//!
//! Core types shared by every Keel crate.
//!
//! This crate contains:
//! - Domain types: the pipeline execution record and its source reference
//! - DTOs: notification payloads published to live observers

pub mod domain;
pub mod dto;
