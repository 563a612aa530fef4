//! Iteration controller and its fault/shutdown coordination.
//!
//! This crate sequences the phases of an iterative simulation, fires the
//! lifecycle events around them, reseeds the shared random source every
//! iteration, times every phase, and guarantees that any failure or
//! interrupt leads to exactly one, well-ordered teardown. What the phases
//! compute is supplied from outside through [`SimulationHooks`] and
//! listeners.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `cyclesim-config.yaml` into
//!   strongly-typed structs.
//! - [`controller`] -- The [`Controller`] state machine and iteration loop.
//! - [`listener`] -- Two-tier [`ListenerBus`] fan-out of lifecycle events.
//! - [`output`] -- Output directory hierarchy and file naming.
//! - [`seed`] -- Per-iteration seeding of the shared random source.
//! - [`shutdown`] -- [`ShutdownCoordinator`]: first-wins fault capture,
//!   interrupts, and the teardown gate.
//! - [`stopwatch`] -- Per-iteration operation timings and their reports.
//!
//! [`SimulationHooks`]: controller::SimulationHooks
//! [`Controller`]: controller::Controller
//! [`ListenerBus`]: listener::ListenerBus
//! [`ShutdownCoordinator`]: shutdown::ShutdownCoordinator

pub mod config;
pub mod controller;
pub mod listener;
pub mod output;
pub mod seed;
pub mod shutdown;
pub mod stopwatch;

pub use config::SimulationConfig;
pub use controller::{
    Controller, ControllerBuilder, ControllerState, RunError, RunSummary, SimContext,
    SimulationHooks, TerminationReason,
};
pub use listener::{ControllerListener, FnListener, ListenerBus, ListenerHandle, ListenerTier};
pub use shutdown::{FaultError, FaultRecord, FaultReporter, ShutdownCoordinator};
