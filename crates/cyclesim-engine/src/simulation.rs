//! [`SimulationHooks`] of the commuter simulation.

use std::sync::Arc;

use cyclesim_core::{ListenerBus, SimContext, SimulationHooks};
use cyclesim_types::IterationIndex;
use tracing::{info, warn};

use crate::listeners::{ReplanningListener, ScoringListener};
use crate::mobsim;
use crate::population::{self, Population, PopulationConfig, SharedPopulation};

/// Wires the commuter population, its listeners, and the congestion
/// mobsim into the controller.
#[derive(Debug)]
pub struct CommuterSimulation {
    config: PopulationConfig,
    population: SharedPopulation,
}

impl CommuterSimulation {
    /// Create the simulation with a fresh population.
    pub fn new(config: PopulationConfig) -> Self {
        let population = Population::new(config.agent_count).shared();
        Self { config, population }
    }

    /// The shared population.
    pub fn population(&self) -> SharedPopulation {
        Arc::clone(&self.population)
    }
}

impl SimulationHooks for CommuterSimulation {
    fn load_core_listeners(&mut self, ctx: &SimContext, bus: &mut ListenerBus) -> anyhow::Result<()> {
        bus.add_core_listener(Arc::new(ReplanningListener::new(
            Arc::clone(&self.population),
            ctx.random.clone(),
            self.config.routes.len(),
            self.config.replanning_share,
        )));
        bus.add_core_listener(Arc::new(ScoringListener::new(
            Arc::clone(&self.population),
            Arc::clone(&ctx.output),
            self.config.routes.clone(),
            self.config.travel_utility_per_hour,
            ctx.config.controller.write_iteration_directories,
        )));
        Ok(())
    }

    fn prepare_for_sim(&mut self, ctx: &SimContext) -> anyhow::Result<()> {
        let mut population = population::lock(&self.population);
        if population.is_empty() {
            warn!("population is empty; iterations will not score anything");
        }
        population.assign_random_routes(&ctx.random, self.config.routes.len());
        info!(
            commuters = population.len(),
            routes = self.config.routes.len(),
            loads = ?population.route_loads(self.config.routes.len()),
            "initial routes assigned"
        );
        Ok(())
    }

    fn run_mobsim(&mut self, ctx: &SimContext, iteration: IterationIndex) -> anyhow::Result<()> {
        let stats = mobsim::run(&self.config, ctx, iteration, &self.population)?;
        if stats.trips == 0 && !ctx.faults.is_shutdown_requested() {
            warn!(
                iteration = stats.iteration,
                loads = ?stats.loads,
                mean_minutes = stats.mean_minutes,
                "mobsim executed no trips"
            );
        }
        Ok(())
    }
}
