//! Keel Engine
//!
//! Drives a pipeline execution from source checkout to a verified deployment.
//!
//! Architecture:
//! - Configuration: settings loaded from the environment or defaults
//! - Collaborators: execution store, notifier and source fetcher contracts
//! - Runners: local processes and remote SSH commands with streamed output
//! - Targets: Kubernetes cluster or a single remote host
//! - Orchestrator: the stage sequence, state machine and rollback
//! - Scheduler: one task per execution, fed through a channel

pub mod config;
pub mod context;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod process;
pub mod quality;
pub mod readiness;
pub mod remote;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod store;
pub mod target;

pub use config::Config;
pub use error::{PipelineError, Result};
pub use orchestrator::PipelineOrchestrator;
pub use scheduler::Dispatcher;
