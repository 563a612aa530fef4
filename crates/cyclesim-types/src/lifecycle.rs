//! Iteration indices, phases, and the lifecycle events fired around them.
//!
//! One iteration is a single pass through the fixed [`Phase`] sequence.
//! Every phase except [`Phase::Mobsim`] is announced to listeners through a
//! [`LifecycleEvent`]; the run as a whole is bracketed by
//! [`LifecycleEvent::Startup`] and [`LifecycleEvent::Shutdown`].

use serde::{Deserialize, Serialize};

/// Index of one iteration. Strictly increases by one per loop pass.
pub type IterationIndex = u32;

/// One named stage within an iteration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Iteration-start listeners, fired right after reseeding.
    IterationStart,
    /// Re-planning listeners. Skipped in the first iteration.
    Replanning,
    /// Listeners that prepare resources for the mobsim.
    BeforeMobsim,
    /// The externally supplied simulation step.
    Mobsim,
    /// Listeners that release mobsim resources. Always fired once the
    /// before-mobsim step has started.
    AfterMobsim,
    /// Scoring listeners.
    Scoring,
    /// Iteration-end listeners.
    IterationEnd,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Self; 7] = [
        Self::IterationStart,
        Self::Replanning,
        Self::BeforeMobsim,
        Self::Mobsim,
        Self::AfterMobsim,
        Self::Scoring,
        Self::IterationEnd,
    ];

    /// Operation name recorded in the stopwatch for this phase.
    pub const fn operation_name(self) -> &'static str {
        match self {
            Self::IterationStart => "iteration_start_listeners",
            Self::Replanning => "replanning",
            Self::BeforeMobsim => "before_mobsim_listeners",
            Self::Mobsim => "mobsim",
            Self::AfterMobsim => "after_mobsim_listeners",
            Self::Scoring => "scoring",
            Self::IterationEnd => "iteration_end_listeners",
        }
    }

    /// The event kind announced for this phase, if any.
    ///
    /// The mobsim itself is not a listener phase; it runs the injected
    /// simulation collaborator instead.
    pub const fn event_kind(self) -> Option<EventKind> {
        match self {
            Self::IterationStart => Some(EventKind::IterationStart),
            Self::Replanning => Some(EventKind::Replanning),
            Self::BeforeMobsim => Some(EventKind::BeforeMobsim),
            Self::Mobsim => None,
            Self::AfterMobsim => Some(EventKind::AfterMobsim),
            Self::Scoring => Some(EventKind::Scoring),
            Self::IterationEnd => Some(EventKind::IterationEnd),
        }
    }
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.operation_name())
    }
}

/// Discriminant of a [`LifecycleEvent`], used for listener subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Fired once before the first iteration.
    Startup,
    /// Start of an iteration.
    IterationStart,
    /// Re-planning step of an iteration.
    Replanning,
    /// Immediately before the mobsim.
    BeforeMobsim,
    /// Immediately after the mobsim.
    AfterMobsim,
    /// Scoring step of an iteration.
    Scoring,
    /// End of an iteration.
    IterationEnd,
    /// Fired exactly once when the run terminates.
    Shutdown,
}

impl EventKind {
    /// All event kinds, in the order they occur during a run.
    pub const ALL: [Self; 8] = [
        Self::Startup,
        Self::IterationStart,
        Self::Replanning,
        Self::BeforeMobsim,
        Self::AfterMobsim,
        Self::Scoring,
        Self::IterationEnd,
        Self::Shutdown,
    ];
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Startup => "startup",
            Self::IterationStart => "iteration_start",
            Self::Replanning => "replanning",
            Self::BeforeMobsim => "before_mobsim",
            Self::AfterMobsim => "after_mobsim",
            Self::Scoring => "scoring",
            Self::IterationEnd => "iteration_end",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// A notification delivered to registered listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The controller finished loading core listeners and is about to
    /// validate the configuration.
    Startup,
    /// An iteration begins.
    IterationStart {
        /// The iteration that begins.
        iteration: IterationIndex,
    },
    /// Agents re-plan before the mobsim.
    Replanning {
        /// The iteration being re-planned.
        iteration: IterationIndex,
    },
    /// The mobsim is about to run.
    BeforeMobsim {
        /// The iteration whose mobsim is about to run.
        iteration: IterationIndex,
    },
    /// The mobsim has returned, successfully or not.
    AfterMobsim {
        /// The iteration whose mobsim has returned.
        iteration: IterationIndex,
    },
    /// Executed plans are scored.
    Scoring {
        /// The iteration being scored.
        iteration: IterationIndex,
    },
    /// An iteration ends.
    IterationEnd {
        /// The iteration that ends.
        iteration: IterationIndex,
    },
    /// The run terminates.
    Shutdown {
        /// `true` unless the stopping predicate ended the run.
        unexpected: bool,
    },
}

impl LifecycleEvent {
    /// Build the event announced by `phase` in `iteration`.
    ///
    /// Returns `None` for [`Phase::Mobsim`], which has no event of its own.
    pub const fn for_phase(phase: Phase, iteration: IterationIndex) -> Option<Self> {
        match phase {
            Phase::IterationStart => Some(Self::IterationStart { iteration }),
            Phase::Replanning => Some(Self::Replanning { iteration }),
            Phase::BeforeMobsim => Some(Self::BeforeMobsim { iteration }),
            Phase::Mobsim => None,
            Phase::AfterMobsim => Some(Self::AfterMobsim { iteration }),
            Phase::Scoring => Some(Self::Scoring { iteration }),
            Phase::IterationEnd => Some(Self::IterationEnd { iteration }),
        }
    }

    /// The kind of this event.
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Startup => EventKind::Startup,
            Self::IterationStart { .. } => EventKind::IterationStart,
            Self::Replanning { .. } => EventKind::Replanning,
            Self::BeforeMobsim { .. } => EventKind::BeforeMobsim,
            Self::AfterMobsim { .. } => EventKind::AfterMobsim,
            Self::Scoring { .. } => EventKind::Scoring,
            Self::IterationEnd { .. } => EventKind::IterationEnd,
            Self::Shutdown { .. } => EventKind::Shutdown,
        }
    }

    /// The iteration this event belongs to. `None` for startup and shutdown.
    pub const fn iteration(&self) -> Option<IterationIndex> {
        match self {
            Self::Startup | Self::Shutdown { .. } => None,
            Self::IterationStart { iteration }
            | Self::Replanning { iteration }
            | Self::BeforeMobsim { iteration }
            | Self::AfterMobsim { iteration }
            | Self::Scoring { iteration }
            | Self::IterationEnd { iteration } => Some(*iteration),
        }
    }
}

impl core::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.iteration() {
            Some(iteration) => write!(f, "{}[{iteration}]", self.kind()),
            None => write!(f, "{}", self.kind()),
        }
    }
}
