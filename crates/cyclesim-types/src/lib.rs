//! Shared type definitions for the cyclesim iteration controller.
//!
//! This crate holds the vocabulary that flows between the controller core,
//! the listeners it notifies, and the simulation collaborators that plug
//! into it.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for run and agent identifiers
//! - [`lifecycle`] -- Iteration indices, phases, and lifecycle events

pub mod ids;
pub mod lifecycle;

pub use ids::{AgentId, RunId};
pub use lifecycle::{EventKind, IterationIndex, LifecycleEvent, Phase};
