//! Core bring-up logic.
//!
//! This module contains:
//! - Step: step descriptors and the standard pipeline
//! - Checkers: read-only probes per subsystem
//! - Executors: idempotent actions per subsystem
//! - Engine: check-before-execute orchestration

pub mod checkers;
pub mod engine;
pub mod executors;
pub mod step;

// Re-export commonly used types
pub use engine::{ArgoClientFactory, ClientFactory, EngineError, ExecutionEngine};
pub use step::{standard_steps, Collaborators, ExecutionStep, StepAction, StepKind};
