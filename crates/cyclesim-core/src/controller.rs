//! The iteration controller: phase sequencing, lifecycle events, and
//! exactly-once teardown.
//!
//! A [`Controller`] is assembled with a [`ControllerBuilder`] from a
//! [`SimulationConfig`] and a [`SimulationHooks`] strategy, then driven by
//! [`Controller::run`]:
//!
//! ```text
//!   Idle ─► Starting ─► Running ─► Terminating ─► Terminated
//!            │            │             │
//!            │            │             └─ Shutdown event, fault log, result
//!            │            └─ for each iteration:
//!            │                 IterationStart ─► Replanning* ─► BeforeMobsim
//!            │                 ─► Mobsim ─► AfterMobsim ─► Scoring ─► IterationEnd
//!            └─ core listeners, Startup event, config check, prepare_for_sim
//! ```
//!
//! Every phase is an iteration step: the stopwatch brackets it, errors and
//! panics are captured by the [`ShutdownCoordinator`], and the shutdown
//! flag is checked afterwards. A set flag yields [`StepOutcome::Aborted`],
//! which skips straight to teardown without being treated as an error.
//! `AfterMobsim` runs whenever `BeforeMobsim` ran, even if the mobsim failed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use cyclesim_types::{IterationIndex, LifecycleEvent, Phase, RunId};

use crate::config::SimulationConfig;
use crate::listener::{ListenerBus, ListenerHandle, ListenerTier};
use crate::output::{OutputDirectory, OutputError};
use crate::seed::{RandomSeedManager, SimRandom};
use crate::shutdown::{FaultError, FaultReporter, ShutdownCoordinator, payload_message};
use crate::stopwatch::IterationStopwatch;

const DIVIDER: &str = "###################################################";
const MARKER: &str = "### ";

/// File name of the configuration dump.
pub const CONFIG_DUMP_FILE: &str = "output_config.yaml";
/// File name of the stopwatch text report.
pub const STOPWATCH_TEXT_FILE: &str = "stopwatch.txt";
/// File name of the stopwatch chart.
pub const STOPWATCH_GRAPH_FILE: &str = "stopwatch.svg";

/// Lifecycle of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Built, not yet run.
    Idle,
    /// One-time setup before the first iteration.
    Starting,
    /// Iterating.
    Running,
    /// Firing `Shutdown` and collecting the result.
    Terminating,
    /// Done. A controller cannot be run again.
    Terminated,
}

impl core::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Result of one iteration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Proceed with the next step.
    Continue,
    /// Shutdown was requested; go straight to teardown.
    Aborted,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The stopping criterion returned `false`.
    Completed,
    /// An external interrupt stopped the run without a computational error.
    Interrupted,
}

/// Summary of a run that ended without a computational error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Identifier of this run.
    pub run_id: RunId,
    /// Why the run ended.
    pub reason: TerminationReason,
    /// Number of iterations that ran through `IterationEnd`.
    pub iterations_completed: u32,
    /// The last iteration that was started, if any.
    pub last_iteration: Option<IterationIndex>,
}

impl RunSummary {
    /// Whether the run ended for any reason other than the stopping
    /// criterion.
    pub const fn is_unexpected(&self) -> bool {
        matches!(self.reason, TerminationReason::Interrupted)
    }
}

/// Errors returned by [`Controller::run`].
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A computational error aborted the run. Returned after teardown.
    #[error("simulation aborted by error in {origin}: {source}")]
    Fault {
        /// Where the error was captured.
        origin: String,
        /// The first captured error.
        #[source]
        source: Arc<FaultError>,
    },

    /// [`Controller::run`] was called more than once.
    #[error("controller has already run")]
    AlreadyRun,
}

/// Errors that can occur while assembling a controller.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// No [`SimulationHooks`] were supplied.
    #[error("no simulation hooks supplied")]
    MissingHooks,

    /// The output directory could not be prepared.
    #[error("failed to prepare output directory: {source}")]
    Output {
        /// The underlying output error.
        #[from]
        source: OutputError,
    },
}

/// Shared resources handed to the simulation hooks.
#[derive(Debug, Clone)]
pub struct SimContext {
    /// The run's configuration.
    pub config: Arc<SimulationConfig>,
    /// The shared random source, reseeded every iteration.
    pub random: SimRandom,
    /// Channel for reporting failures from worker threads.
    pub faults: FaultReporter,
    /// The run's output directory.
    pub output: Arc<OutputDirectory>,
}

/// The simulation-specific collaborators the controller drives.
///
/// Only [`run_mobsim`](Self::run_mobsim) is required.
pub trait SimulationHooks: Send {
    /// Register the built-in listeners before `Startup` is fired.
    fn load_core_listeners(&mut self, ctx: &SimContext, bus: &mut ListenerBus) -> anyhow::Result<()> {
        let _ = (ctx, bus);
        Ok(())
    }

    /// One-time setup after the configuration was checked.
    fn prepare_for_sim(&mut self, ctx: &SimContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Execute the simulation step of `iteration`.
    ///
    /// Worker threads started here must report their failures through
    /// [`SimContext::faults`].
    fn run_mobsim(&mut self, ctx: &SimContext, iteration: IterationIndex) -> anyhow::Result<()>;

    /// Whether `iteration` should run. Defaults to
    /// `iteration <= controller.last_iteration`.
    fn continue_iterations(&mut self, ctx: &SimContext, iteration: IterationIndex) -> bool {
        iteration <= ctx.config.controller.last_iteration
    }
}

type StoppingCriterion = Box<dyn FnMut(IterationIndex) -> bool + Send>;

/// Assembles a [`Controller`].
pub struct ControllerBuilder {
    config: SimulationConfig,
    hooks: Option<Box<dyn SimulationHooks>>,
    stopping: Option<StoppingCriterion>,
    listeners: Vec<ListenerHandle>,
}

impl core::fmt::Debug for ControllerBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ControllerBuilder")
            .field("config", &self.config)
            .field("has_hooks", &self.hooks.is_some())
            .field("has_stopping_criterion", &self.stopping.is_some())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ControllerBuilder {
    /// Start a builder for `config`.
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            hooks: None,
            stopping: None,
            listeners: Vec::new(),
        }
    }

    /// Set the simulation hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: impl SimulationHooks + 'static) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    /// Replace [`SimulationHooks::continue_iterations`] with `criterion`.
    #[must_use]
    pub fn stopping_criterion(
        mut self,
        criterion: impl FnMut(IterationIndex) -> bool + Send + 'static,
    ) -> Self {
        self.stopping = Some(Box::new(criterion));
        self
    }

    /// Register a user-tier listener.
    #[must_use]
    pub fn listener(mut self, listener: ListenerHandle) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Prepare the output directory and build the controller.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::MissingHooks`] without hooks, or
    /// [`BuildError::Output`] if the output directory cannot be prepared.
    pub fn build(self) -> Result<Controller, BuildError> {
        let hooks = self.hooks.ok_or(BuildError::MissingHooks)?;
        let output = Arc::new(OutputDirectory::prepare(&self.config.controller)?);
        let config = Arc::new(self.config);
        let seeds = RandomSeedManager::new(config.global.random_seed);
        let coordinator = Arc::new(ShutdownCoordinator::new());

        let mut bus = ListenerBus::new();
        for listener in self.listeners {
            bus.register(listener, ListenerTier::User);
        }

        let context = SimContext {
            config: Arc::clone(&config),
            random: seeds.random(),
            faults: coordinator.reporter(),
            output,
        };
        let run_id = RunId::new();
        info!(%run_id, output = %context.output.root().display(), "controller built");

        Ok(Controller {
            run_id,
            config,
            context,
            hooks,
            stopping: self.stopping,
            bus,
            seeds,
            stopwatch: IterationStopwatch::new(),
            coordinator,
            state: ControllerState::Idle,
            iterations_completed: 0,
            last_iteration: None,
        })
    }
}

/// Drives one simulation run.
pub struct Controller {
    run_id: RunId,
    config: Arc<SimulationConfig>,
    context: SimContext,
    hooks: Box<dyn SimulationHooks>,
    stopping: Option<StoppingCriterion>,
    bus: ListenerBus,
    seeds: RandomSeedManager,
    stopwatch: IterationStopwatch,
    coordinator: Arc<ShutdownCoordinator>,
    state: ControllerState,
    iterations_completed: u32,
    last_iteration: Option<IterationIndex>,
}

impl core::fmt::Debug for Controller {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Controller")
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .field("bus", &self.bus)
            .field("iterations_completed", &self.iterations_completed)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Start building a controller for `config`.
    pub fn builder(config: SimulationConfig) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    /// Identifier of this run.
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> ControllerState {
        self.state
    }

    /// The shutdown coordinator; hand it to threads that may interrupt.
    pub fn coordinator(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Resources shared with the simulation hooks.
    pub const fn context(&self) -> &SimContext {
        &self.context
    }

    /// The timing ledger recorded so far.
    pub const fn stopwatch(&self) -> &IterationStopwatch {
        &self.stopwatch
    }

    /// The listener registrations.
    pub const fn listeners(&self) -> &ListenerBus {
        &self.bus
    }

    /// Register a user-tier listener.
    pub fn add_listener(&mut self, listener: ListenerHandle) {
        self.bus.register(listener, ListenerTier::User);
    }

    /// Run the simulation to completion, interruption, or failure.
    ///
    /// The `Shutdown` event fires exactly once before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Fault`] carrying the first computational error
    /// after teardown, or [`RunError::AlreadyRun`] on a second call.
    pub fn run(&mut self) -> Result<RunSummary, RunError> {
        if self.state != ControllerState::Idle {
            return Err(RunError::AlreadyRun);
        }
        self.coordinator.bind_controller_thread();
        let _panic_hook = self
            .config
            .controller
            .capture_panics
            .then(|| self.coordinator.install_panic_hook());

        self.transition(ControllerState::Starting);
        if self.startup() == StepOutcome::Continue {
            self.transition(ControllerState::Running);
            self.iterate();
        }

        self.transition(ControllerState::Terminating);
        let result = self.teardown();
        self.transition(ControllerState::Terminated);
        self.coordinator.mark_terminated();
        result
    }

    fn transition(&mut self, next: ControllerState) {
        debug!(from = %self.state, to = %next, "controller state change");
        self.state = next;
    }

    // -----------------------------------------------------------------------
    // Starting
    // -----------------------------------------------------------------------

    fn startup(&mut self) -> StepOutcome {
        info!(run_id = %self.run_id, "starting simulation run");

        let outcome = self.guarded("load_core_listeners".to_owned(), |c| {
            c.hooks
                .load_core_listeners(&c.context, &mut c.bus)
                .map_err(|source| FaultError::Setup {
                    stage: "load_core_listeners",
                    source,
                })
        });
        if outcome == StepOutcome::Aborted {
            return outcome;
        }
        info!(
            core = self.bus.len(ListenerTier::Core),
            user = self.bus.len(ListenerTier::User),
            "listeners loaded"
        );

        let outcome = self.guarded("startup listeners".to_owned(), |c| {
            c.fire(LifecycleEvent::Startup)
        });
        if outcome == StepOutcome::Aborted {
            return outcome;
        }

        let outcome = self.guarded("check_consistency".to_owned(), Self::check_and_dump_config);
        if outcome == StepOutcome::Aborted {
            return outcome;
        }

        self.guarded("prepare_for_sim".to_owned(), |c| {
            c.hooks
                .prepare_for_sim(&c.context)
                .map_err(|source| FaultError::Setup {
                    stage: "prepare_for_sim",
                    source,
                })
        })
    }

    fn check_and_dump_config(&mut self) -> Result<(), FaultError> {
        let setup = |stage, source: anyhow::Error| FaultError::Setup { stage, source };

        // The dump is logged and written even when the check then fails.
        let dump = self
            .config
            .to_yaml()
            .map_err(|e| setup("dump_config", e.into()))?;
        info!("complete configuration:\n{dump}");

        let path = self.context.output.output_filename(CONFIG_DUMP_FILE);
        std::fs::write(&path, dump).map_err(|e| {
            setup(
                "write_config_dump",
                anyhow::Error::new(e).context(path.display().to_string()),
            )
        })?;
        debug!(path = %path.display(), "configuration dump written");

        self.config
            .check_consistency()
            .map_err(|e| setup("check_consistency", e.into()))
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    fn iterate(&mut self) {
        let first = self.config.controller.first_iteration;
        let mut iteration = first;
        while self.should_continue(iteration) {
            self.last_iteration = Some(iteration);
            if self.run_iteration(iteration, first) == StepOutcome::Aborted {
                return;
            }
            self.iterations_completed = self.iterations_completed.saturating_add(1);
            let Some(next) = iteration.checked_add(1) else {
                warn!(iteration, "iteration index space exhausted");
                return;
            };
            iteration = next;
        }
        if self.coordinator.is_shutdown_requested() {
            warn!(iteration, "shutdown requested; next iteration not started");
        } else {
            info!(iteration, "stopping criterion reached");
        }
    }

    fn should_continue(&mut self, iteration: IterationIndex) -> bool {
        if self.coordinator.is_shutdown_requested() {
            return false;
        }
        let decision = std::panic::catch_unwind(AssertUnwindSafe(|| match &mut self.stopping {
            Some(criterion) => criterion(iteration),
            None => self.hooks.continue_iterations(&self.context, iteration),
        }));
        decision.unwrap_or_else(|payload| {
            self.record_panic("continue_iterations".to_owned(), payload.as_ref());
            false
        })
    }

    fn run_iteration(&mut self, iteration: IterationIndex, first: IterationIndex) -> StepOutcome {
        info!("{DIVIDER}");
        info!("{MARKER}ITERATION {iteration} BEGINS");
        self.stopwatch.begin_iteration(iteration);

        let outcome = self.iteration_phases(iteration, first);

        self.stopwatch.end_iteration();
        if outcome == StepOutcome::Continue {
            self.persist_stopwatch();
            info!("{MARKER}ITERATION {iteration} ENDS");
            info!("{DIVIDER}");
        }
        outcome
    }

    fn iteration_phases(&mut self, iteration: IterationIndex, first: IterationIndex) -> StepOutcome {
        let outcome = self.iteration_step(Phase::IterationStart, iteration, |c| {
            if c.config.controller.write_iteration_directories {
                c.context
                    .output
                    .create_iteration_directory(iteration)
                    .map_err(|e| FaultError::Phase {
                        phase: Phase::IterationStart,
                        iteration,
                        source: e.into(),
                    })?;
            }
            c.seeds.reseed(iteration);
            c.fire(LifecycleEvent::IterationStart { iteration })
        });
        if outcome == StepOutcome::Aborted {
            return outcome;
        }

        if iteration > first && self.listener_phase(Phase::Replanning, iteration) == StepOutcome::Aborted {
            return StepOutcome::Aborted;
        }

        // AfterMobsim runs whenever BeforeMobsim ran.
        let before = self.listener_phase(Phase::BeforeMobsim, iteration);
        let mobsim = match before {
            StepOutcome::Continue => self.iteration_step(Phase::Mobsim, iteration, |c| {
                c.seeds.reseed(iteration);
                c.hooks
                    .run_mobsim(&c.context, iteration)
                    .map_err(|source| FaultError::Phase {
                        phase: Phase::Mobsim,
                        iteration,
                        source,
                    })
            }),
            StepOutcome::Aborted => StepOutcome::Aborted,
        };
        let after = self.listener_phase(Phase::AfterMobsim, iteration);
        if mobsim == StepOutcome::Aborted || after == StepOutcome::Aborted {
            return StepOutcome::Aborted;
        }

        if self.listener_phase(Phase::Scoring, iteration) == StepOutcome::Aborted {
            return StepOutcome::Aborted;
        }
        self.listener_phase(Phase::IterationEnd, iteration)
    }

    fn listener_phase(&mut self, phase: Phase, iteration: IterationIndex) -> StepOutcome {
        self.iteration_step(phase, iteration, |c| {
            LifecycleEvent::for_phase(phase, iteration).map_or(Ok(()), |event| c.fire(event))
        })
    }

    /// Run one phase bracketed by the stopwatch, then check the flag.
    fn iteration_step<F>(&mut self, phase: Phase, iteration: IterationIndex, work: F) -> StepOutcome
    where
        F: FnOnce(&mut Self) -> Result<(), FaultError>,
    {
        let operation = phase.operation_name();
        debug!(%phase, iteration, "phase begins");
        self.stopwatch.begin_operation(operation);
        let outcome = self.guarded(format!("{phase} in iteration {iteration}"), work);
        self.stopwatch.end_operation(operation);
        debug!(%phase, iteration, ?outcome, "phase ends");
        outcome
    }

    /// Run `work`, capture its error or panic, then check the flag.
    fn guarded<F>(&mut self, origin: String, work: F) -> StepOutcome
    where
        F: FnOnce(&mut Self) -> Result<(), FaultError>,
    {
        match std::panic::catch_unwind(AssertUnwindSafe(|| work(self))) {
            Ok(Ok(())) => {}
            Ok(Err(fault)) => {
                self.coordinator.record_fault(origin, fault);
            }
            Err(payload) => self.record_panic(origin, payload.as_ref()),
        }
        if self.coordinator.is_shutdown_requested() {
            StepOutcome::Aborted
        } else {
            StepOutcome::Continue
        }
    }

    fn record_panic(&self, origin: String, payload: &(dyn std::any::Any + Send)) {
        // The installed panic hook has captured it already.
        if self.config.controller.capture_panics && self.coordinator.captured_fault().is_some() {
            return;
        }
        self.coordinator.record_fault(
            origin.clone(),
            FaultError::Panic {
                origin,
                message: payload_message(payload),
            },
        );
    }

    fn fire(&self, event: LifecycleEvent) -> Result<(), FaultError> {
        let delivered = self.bus.notify(&event)?;
        debug!(%event, delivered, "event delivered");
        Ok(())
    }

    fn persist_stopwatch(&self) {
        let text = self.context.output.output_filename(STOPWATCH_TEXT_FILE);
        if let Err(e) = self.stopwatch.write_text_file(&text) {
            warn!(error = %e, "failed to write stopwatch report");
        }
        if self.config.controller.create_graphs {
            let graph = self.context.output.output_filename(STOPWATCH_GRAPH_FILE);
            if let Err(e) = self.stopwatch.write_graph_file(&graph) {
                warn!(error = %e, "failed to write stopwatch chart");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Terminating
    // -----------------------------------------------------------------------

    fn teardown(&mut self) -> Result<RunSummary, RunError> {
        if !self.coordinator.begin_teardown() {
            warn!("teardown was already claimed");
        }
        // The fault slot is frozen once teardown is claimed.
        let fault = self.coordinator.captured_fault();
        let unexpected = self.coordinator.is_shutdown_requested() || fault.is_some();

        info!("S H U T D O W N   ---   start shutdown");
        if unexpected {
            error!("ERROR --- This is an unexpected shutdown!");
        }

        let event = LifecycleEvent::Shutdown { unexpected };
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.bus.notify(&event))) {
            Ok(Ok(delivered)) => debug!(delivered, "shutdown listeners notified"),
            Ok(Err(e)) => error!(error = %e, "shutdown listener failed"),
            Err(payload) => error!(
                message = %payload_message(payload.as_ref()),
                "shutdown listener panicked"
            ),
        }

        if let Some(record) = &fault {
            error!(
                origin = record.origin(),
                error = %record.error(),
                captured_at = %record.captured_at(),
                "simulation terminated by error"
            );
        }
        if unexpected {
            error!("ERROR --- Shutdown completed, but the simulation was unexpectedly terminated.");
            error!("ERROR --- The results should not be used for further analysis.");
        } else {
            info!(
                iterations = self.iterations_completed,
                "S H U T D O W N   ---   shutdown completed"
            );
        }

        match fault {
            Some(record) => Err(RunError::Fault {
                origin: record.origin().to_owned(),
                source: record.shared_error(),
            }),
            None => Ok(RunSummary {
                run_id: self.run_id,
                reason: if unexpected {
                    TerminationReason::Interrupted
                } else {
                    TerminationReason::Completed
                },
                iterations_completed: self.iterations_completed,
                last_iteration: self.last_iteration,
            }),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // Release interrupters even if the controller never ran.
        self.coordinator.mark_terminated();
    }
}
