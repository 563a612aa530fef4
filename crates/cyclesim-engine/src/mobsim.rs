//! Congestion mobsim: turns route choices into travel times.
//!
//! Route travel times follow the BPR volume-delay function
//! `t = t0 * (1 + 0.15 * (load / capacity)^4)`, perturbed per commuter by a
//! small seeded jitter. The per-commuter work is split into chunks that run
//! on worker threads started through [`FaultReporter::spawn_worker`], so a
//! failing worker aborts the run through the controller's fault channel.
//!
//! [`FaultReporter::spawn_worker`]: cyclesim_core::FaultReporter::spawn_worker

use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context as _, bail};
use cyclesim_core::SimContext;
use cyclesim_types::IterationIndex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::population::{self, PopulationConfig, RouteConfig, SharedPopulation};

const BPR_ALPHA: f64 = 0.15;
const BPR_BETA: i32 = 4;

/// Maximum relative deviation of one trip from the route travel time.
const JITTER: f64 = 0.05;

/// Aggregate outcome of one mobsim run.
#[derive(Debug, Clone, PartialEq)]
pub struct MobsimStats {
    /// The simulated iteration.
    pub iteration: IterationIndex,
    /// Commuters per route.
    pub loads: Vec<u32>,
    /// Mean travel time over all trips, in minutes.
    pub mean_minutes: f64,
    /// Number of trips that received a travel time.
    pub trips: usize,
}

/// Congested travel time of `route` carrying `load` commuters.
pub fn congested_minutes(route: &RouteConfig, load: u32) -> f64 {
    let ratio = f64::from(load) / f64::from(route.capacity.max(1));
    route.free_flow_minutes * BPR_ALPHA.mul_add(ratio.powi(BPR_BETA), 1.0)
}

/// Run the mobsim for `iteration` and store travel times in `population`.
///
/// Draws the per-trip jitter from the shared random source before any
/// worker starts, so results do not depend on thread scheduling.
///
/// # Errors
///
/// Returns an error if a worker thread cannot be started. Failures inside
/// workers are reported through [`SimContext::faults`] instead.
pub fn run(
    config: &PopulationConfig,
    ctx: &SimContext,
    iteration: IterationIndex,
    population: &SharedPopulation,
) -> anyhow::Result<MobsimStats> {
    let routes: Arc<Vec<RouteConfig>> = Arc::new(config.routes.clone());
    let (choices, loads) = {
        let population = population::lock(population);
        let choices: Vec<(usize, usize)> = population
            .commuters()
            .iter()
            .enumerate()
            .map(|(idx, c)| (idx, c.route))
            .collect();
        (choices, population.route_loads(routes.len()))
    };
    let route_minutes: Arc<Vec<f64>> = Arc::new(
        routes
            .iter()
            .zip(&loads)
            .map(|(route, load)| congested_minutes(route, *load))
            .collect(),
    );
    let jitter: Vec<f64> = ctx.random.with_rng(|rng| {
        choices
            .iter()
            .map(|_| rng.random_range(-JITTER..=JITTER))
            .collect()
    });

    let workers = usize::try_from(config.mobsim_workers.max(1)).unwrap_or(1);
    let chunk_size = choices.len().div_ceil(workers).max(1);
    let (tx, rx) = mpsc::channel::<(usize, f64)>();
    let mut handles = Vec::new();

    for (worker, (chunk, jitter)) in choices
        .chunks(chunk_size)
        .zip(jitter.chunks(chunk_size))
        .enumerate()
    {
        let chunk = chunk.to_vec();
        let jitter = jitter.to_vec();
        let route_minutes = Arc::clone(&route_minutes);
        let tx = tx.clone();
        let inject_failure = worker == 0 && config.fail_mobsim_at == Some(iteration);
        let handle = ctx
            .faults
            .spawn_worker(format!("mobsim-worker-{worker}"), move |reporter| {
                if inject_failure {
                    bail!("injected mobsim failure in iteration {iteration}");
                }
                for ((idx, route), noise) in chunk.into_iter().zip(jitter) {
                    if reporter.is_shutdown_requested() {
                        return Ok(());
                    }
                    let Some(base) = route_minutes.get(route) else {
                        bail!("commuter {idx} uses unknown route {route}");
                    };
                    tx.send((idx, base * (1.0 + noise)))
                        .context("mobsim result channel closed")?;
                }
                Ok(())
            })
            .context("failed to start mobsim worker")?;
        handles.push(handle);
    }
    drop(tx);

    let mut results: Vec<(usize, f64)> = rx.iter().collect();
    for handle in handles {
        if handle.join().is_err() {
            warn!("mobsim worker terminated abnormally");
        }
    }

    if ctx.faults.is_shutdown_requested() {
        debug!(iteration, "shutdown requested; travel times discarded");
        return Ok(MobsimStats {
            iteration,
            loads,
            mean_minutes: 0.0,
            trips: 0,
        });
    }

    results.sort_by_key(|(idx, _)| *idx);
    let mut population = population::lock(population);
    let commuters = population.commuters_mut();
    let mut total = 0.0_f64;
    for (idx, minutes) in &results {
        if let Some(commuter) = commuters.get_mut(*idx) {
            commuter.travel_minutes = Some(*minutes);
            total += minutes;
        }
    }
    let trips = results.len();
    let mean_minutes = if trips == 0 {
        0.0
    } else {
        total / f64::from(u32::try_from(trips).unwrap_or(u32::MAX))
    };

    info!(iteration, trips, mean_minutes, ?loads, "mobsim finished");
    Ok(MobsimStats {
        iteration,
        loads,
        mean_minutes,
        trips,
    })
}
