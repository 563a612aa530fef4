//! Commuter population for the demonstration simulation.
//!
//! Every commuter travels once per iteration along one of a fixed set of
//! alternative routes. Re-planning switches a share of commuters to a random
//! route, the mobsim turns route loads into congested travel times, and
//! scoring converts travel times into utilities.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cyclesim_core::seed::SimRandom;
use cyclesim_types::{AgentId, IterationIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// -----------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------

/// Configuration of the commuter population, read from the `population`
/// section of `cyclesim-config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationConfig {
    /// Number of commuters.
    #[serde(default = "default_agent_count")]
    pub agent_count: u32,

    /// Alternative routes between home and work.
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,

    /// Share of commuters that pick a new random route when re-planning.
    #[serde(default = "default_replanning_share")]
    pub replanning_share: f64,

    /// Number of mobsim worker threads.
    #[serde(default = "default_mobsim_workers")]
    pub mobsim_workers: u32,

    /// Utility of one hour spent travelling (negative).
    #[serde(default = "default_travel_utility_per_hour")]
    pub travel_utility_per_hour: f64,

    /// Make one mobsim worker fail in this iteration. Used to exercise
    /// the abort path.
    #[serde(default)]
    pub fail_mobsim_at: Option<IterationIndex>,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            agent_count: default_agent_count(),
            routes: default_routes(),
            replanning_share: default_replanning_share(),
            mobsim_workers: default_mobsim_workers(),
            travel_utility_per_hour: default_travel_utility_per_hour(),
            fail_mobsim_at: None,
        }
    }
}

impl PopulationConfig {
    /// Check that the population can be simulated.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Population`] when no routes are configured, a
    /// route has zero capacity or a negative free-flow time, the re-planning
    /// share lies outside `[0, 1]`, or no mobsim worker is configured.
    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |message: String| Err(EngineError::Population { message });
        if self.routes.is_empty() {
            return fail("at least one route is required".to_owned());
        }
        if let Some(route) = self.routes.iter().find(|r| r.capacity == 0) {
            return fail(format!("route '{}' has zero capacity", route.name));
        }
        if let Some(route) = self
            .routes
            .iter()
            .find(|r| !(r.free_flow_minutes.is_finite() && r.free_flow_minutes >= 0.0))
        {
            return fail(format!("route '{}' has an invalid free-flow time", route.name));
        }
        if !(0.0..=1.0).contains(&self.replanning_share) {
            return fail(format!(
                "replanning_share must lie in [0, 1], got {}",
                self.replanning_share
            ));
        }
        if self.mobsim_workers == 0 {
            return fail("mobsim_workers must be at least 1".to_owned());
        }
        Ok(())
    }
}

/// One alternative route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Display name.
    pub name: String,
    /// Travel time on an empty route, in minutes.
    pub free_flow_minutes: f64,
    /// Commuters the route carries before congestion sets in.
    pub capacity: u32,
}

const fn default_agent_count() -> u32 {
    500
}

fn default_routes() -> Vec<RouteConfig> {
    vec![
        RouteConfig {
            name: String::from("motorway"),
            free_flow_minutes: 20.0,
            capacity: 250,
        },
        RouteConfig {
            name: String::from("arterial"),
            free_flow_minutes: 28.0,
            capacity: 180,
        },
        RouteConfig {
            name: String::from("backroads"),
            free_flow_minutes: 35.0,
            capacity: 120,
        },
    ]
}

const fn default_replanning_share() -> f64 {
    0.1
}

const fn default_mobsim_workers() -> u32 {
    4
}

const fn default_travel_utility_per_hour() -> f64 {
    -6.0
}

// -----------------------------------------------------------------------
// Population
// -----------------------------------------------------------------------

/// One commuter and the outcome of its latest trip.
#[derive(Debug, Clone, PartialEq)]
pub struct Commuter {
    /// Unique identifier.
    pub id: AgentId,
    /// Index into the configured routes.
    pub route: usize,
    /// Travel time of the last executed trip, in minutes.
    pub travel_minutes: Option<f64>,
    /// Score of the last executed trip.
    pub score: Option<f64>,
}

/// All commuters of the run.
#[derive(Debug, Clone, Default)]
pub struct Population {
    commuters: Vec<Commuter>,
}

/// The population shared by the mobsim and the listeners.
pub type SharedPopulation = Arc<Mutex<Population>>;

impl Population {
    /// Create `count` commuters, all on the first route.
    pub fn new(count: u32) -> Self {
        let commuters = (0..count)
            .map(|_| Commuter {
                id: AgentId::new(),
                route: 0,
                travel_minutes: None,
                score: None,
            })
            .collect();
        Self { commuters }
    }

    /// Wrap the population for sharing.
    pub fn shared(self) -> SharedPopulation {
        Arc::new(Mutex::new(self))
    }

    /// Number of commuters.
    pub fn len(&self) -> usize {
        self.commuters.len()
    }

    /// Whether there are no commuters.
    pub fn is_empty(&self) -> bool {
        self.commuters.is_empty()
    }

    /// All commuters.
    pub fn commuters(&self) -> &[Commuter] {
        &self.commuters
    }

    /// All commuters, mutably.
    pub fn commuters_mut(&mut self) -> &mut [Commuter] {
        &mut self.commuters
    }

    /// Give every commuter a uniformly random route.
    pub fn assign_random_routes(&mut self, random: &SimRandom, route_count: usize) {
        if route_count == 0 {
            return;
        }
        random.with_rng(|rng| {
            for commuter in &mut self.commuters {
                commuter.route = rng.random_range(0..route_count);
            }
        });
    }

    /// Number of commuters on each of `route_count` routes.
    pub fn route_loads(&self, route_count: usize) -> Vec<u32> {
        let mut loads = vec![0_u32; route_count];
        for commuter in &self.commuters {
            if let Some(load) = loads.get_mut(commuter.route) {
                *load = load.saturating_add(1);
            }
        }
        loads
    }
}

/// Lock the shared population.
pub fn lock(population: &SharedPopulation) -> MutexGuard<'_, Population> {
    // Commuter records stay valid even if a holder panicked mid-update.
    population.lock().unwrap_or_else(PoisonError::into_inner)
}
