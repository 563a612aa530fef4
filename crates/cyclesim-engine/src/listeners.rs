//! Core listeners of the commuter simulation.
//!
//! - [`ReplanningListener`] switches a share of commuters to a random route.
//! - [`ScoringListener`] scores executed trips, keeps the score history, and
//!   rewrites `scorestats.txt` every iteration.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context as _;
use cyclesim_core::output::OutputDirectory;
use cyclesim_core::seed::SimRandom;
use cyclesim_core::ControllerListener;
use cyclesim_types::{EventKind, IterationIndex, LifecycleEvent};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::population::{self, RouteConfig, SharedPopulation};

/// File name of the score statistics report.
pub const SCORESTATS_FILE: &str = "scorestats.txt";

/// File name of the per-iteration route load table.
pub const ROUTE_LOADS_FILE: &str = "route_loads.txt";

// -----------------------------------------------------------------------
// Re-planning
// -----------------------------------------------------------------------

/// Moves a random share of commuters to a random route.
#[derive(Debug)]
pub struct ReplanningListener {
    population: SharedPopulation,
    random: SimRandom,
    route_count: usize,
    share: f64,
}

impl ReplanningListener {
    /// Create a listener that re-plans `share` of `population`.
    pub const fn new(
        population: SharedPopulation,
        random: SimRandom,
        route_count: usize,
        share: f64,
    ) -> Self {
        Self {
            population,
            random,
            route_count,
            share,
        }
    }
}

impl ControllerListener for ReplanningListener {
    fn name(&self) -> &str {
        "replanning"
    }

    fn subscribes_to(&self, kind: EventKind) -> bool {
        kind == EventKind::Replanning
    }

    fn notify(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        if self.route_count == 0 {
            return Ok(());
        }
        let mut population = population::lock(&self.population);
        let mut replanned: usize = 0;
        self.random.with_rng(|rng| {
            for commuter in population.commuters_mut() {
                if rng.random::<f64>() < self.share {
                    commuter.route = rng.random_range(0..self.route_count);
                    replanned = replanned.saturating_add(1);
                }
            }
        });
        debug!(%event, replanned, "commuters re-planned");
        Ok(())
    }
}

// -----------------------------------------------------------------------
// Scoring
// -----------------------------------------------------------------------

/// Score statistics of one iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreStats {
    /// The scored iteration.
    pub iteration: IterationIndex,
    /// Mean score over scored commuters.
    pub average: f64,
    /// Highest score.
    pub best: f64,
    /// Lowest score.
    pub worst: f64,
    /// Number of commuters with an executed trip.
    pub scored: usize,
}

/// Scores executed trips and persists the score history.
#[derive(Debug)]
pub struct ScoringListener {
    population: SharedPopulation,
    output: Arc<OutputDirectory>,
    routes: Vec<RouteConfig>,
    utility_per_hour: f64,
    write_iteration_files: bool,
    history: Mutex<Vec<ScoreStats>>,
}

impl ScoringListener {
    /// Create a scoring listener writing into `output`.
    pub const fn new(
        population: SharedPopulation,
        output: Arc<OutputDirectory>,
        routes: Vec<RouteConfig>,
        utility_per_hour: f64,
        write_iteration_files: bool,
    ) -> Self {
        Self {
            population,
            output,
            routes,
            utility_per_hour,
            write_iteration_files,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Statistics of every scored iteration so far.
    pub fn history(&self) -> Vec<ScoreStats> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn score(&self, iteration: IterationIndex) -> anyhow::Result<()> {
        let (stats, loads) = {
            let mut population = population::lock(&self.population);
            let mut scores = Vec::with_capacity(population.len());
            for commuter in population.commuters_mut() {
                commuter.score = commuter
                    .travel_minutes
                    .map(|minutes| self.utility_per_hour * minutes / 60.0);
                scores.extend(commuter.score);
            }
            (
                summarize(iteration, &scores),
                population.route_loads(self.routes.len()),
            )
        };
        info!(
            iteration,
            average = stats.average,
            best = stats.best,
            worst = stats.worst,
            scored = stats.scored,
            "iteration scored"
        );

        let report = {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push(stats);
            render_scorestats(&history)?
        };
        let path = self.output.output_filename(SCORESTATS_FILE);
        std::fs::write(&path, report)
            .with_context(|| format!("failed to write {}", path.display()))?;

        if self.write_iteration_files {
            let path = self.output.iteration_filename(iteration, ROUTE_LOADS_FILE);
            let table = render_route_loads(&self.routes, &loads)?;
            std::fs::write(&path, table)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        Ok(())
    }
}

impl ControllerListener for ScoringListener {
    fn name(&self) -> &str {
        "scoring"
    }

    fn subscribes_to(&self, kind: EventKind) -> bool {
        matches!(kind, EventKind::Scoring | EventKind::Shutdown)
    }

    fn notify(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        match event {
            LifecycleEvent::Scoring { iteration } => self.score(*iteration),
            LifecycleEvent::Shutdown { unexpected } => {
                let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
                match history.last() {
                    Some(last) => info!(
                        iterations = history.len(),
                        last_iteration = last.iteration,
                        final_average = last.average,
                        unexpected,
                        "score history closed"
                    ),
                    None => warn!(unexpected, "run ended before any iteration was scored"),
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn summarize(iteration: IterationIndex, scores: &[f64]) -> ScoreStats {
    let scored = scores.len();
    if scored == 0 {
        return ScoreStats {
            iteration,
            average: 0.0,
            best: 0.0,
            worst: 0.0,
            scored,
        };
    }
    let total: f64 = scores.iter().sum();
    ScoreStats {
        iteration,
        average: total / f64::from(u32::try_from(scored).unwrap_or(u32::MAX)),
        best: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        worst: scores.iter().copied().fold(f64::INFINITY, f64::min),
        scored,
    }
}

fn render_scorestats(history: &[ScoreStats]) -> Result<String, std::fmt::Error> {
    let mut out = String::from("ITERATION\tavg_executed\tbest\tworst\tscored\n");
    for stats in history {
        writeln!(
            out,
            "{}\t{:.4}\t{:.4}\t{:.4}\t{}",
            stats.iteration, stats.average, stats.best, stats.worst, stats.scored
        )?;
    }
    Ok(out)
}

fn render_route_loads(routes: &[RouteConfig], loads: &[u32]) -> Result<String, std::fmt::Error> {
    let mut out = String::from("route\tcommuters\n");
    for (route, load) in routes.iter().zip(loads) {
        writeln!(out, "{}\t{load}", route.name)?;
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use cyclesim_core::config::{ControllerConfig, OverwritePolicy};

    use super::*;
    use crate::population::{Population, PopulationConfig};

    fn output(label: &str) -> (Arc<OutputDirectory>, PathBuf) {
        let root = std::env::temp_dir().join(format!(
            "cyclesim_listeners_{label}_{}_{:?}",
            std::process::id(),
            std::thread::current().id(),
        ));
        let config = ControllerConfig {
            output_directory: root.clone(),
            overwrite_files: OverwritePolicy::DeleteDirectoryIfExists,
            ..ControllerConfig::default()
        };
        (Arc::new(OutputDirectory::prepare(&config).unwrap()), root)
    }

    #[test]
    fn summarize_finds_extremes() {
        let stats = summarize(4, &[-2.0, -1.0, -3.0]);
        assert_eq!(stats.iteration, 4);
        assert_eq!(stats.scored, 3);
        assert!((stats.average + 2.0).abs() < 1e-9);
        assert!((stats.best + 1.0).abs() < 1e-9);
        assert!((stats.worst + 3.0).abs() < 1e-9);
    }

    #[test]
    fn summarize_handles_no_scores() {
        let stats = summarize(0, &[]);
        assert_eq!(stats.scored, 0);
        assert!(stats.average.abs() < f64::EPSILON);
    }

    #[test]
    fn replanning_only_listens_to_replanning() {
        let listener = ReplanningListener::new(
            Population::new(1).shared(),
            SimRandom::new(1),
            3,
            0.5,
        );
        assert!(listener.subscribes_to(EventKind::Replanning));
        assert!(!listener.subscribes_to(EventKind::Scoring));
    }

    #[test]
    fn full_share_replanning_is_seed_determined() {
        let run = || {
            let population = Population::new(40).shared();
            let random = SimRandom::new(0);
            random.reseed(12);
            let listener = ReplanningListener::new(Arc::clone(&population), random, 3, 1.0);
            listener
                .notify(&LifecycleEvent::Replanning { iteration: 1 })
                .unwrap();
            let routes: Vec<usize> = population::lock(&population)
                .commuters()
                .iter()
                .map(|c| c.route)
                .collect();
            routes
        };
        let first = run();
        assert_eq!(first, run());
        assert!(first.iter().any(|r| *r != 0));
    }

    #[test]
    fn scoring_writes_history_and_route_loads() {
        let (output, root) = output("scoring");
        let routes = PopulationConfig::default().routes;
        let population = Population::new(3).shared();
        for commuter in population::lock(&population).commuters_mut() {
            commuter.travel_minutes = Some(30.0);
        }
        output.create_iteration_directory(0).unwrap();
        output.create_iteration_directory(1).unwrap();
        let listener = ScoringListener::new(
            Arc::clone(&population),
            Arc::clone(&output),
            routes,
            -6.0,
            true,
        );

        listener.notify(&LifecycleEvent::Scoring { iteration: 0 }).unwrap();
        listener.notify(&LifecycleEvent::Scoring { iteration: 1 }).unwrap();
        listener
            .notify(&LifecycleEvent::Shutdown { unexpected: false })
            .unwrap();

        let history = listener.history();
        assert_eq!(history.len(), 2);
        assert!((history[1].average + 3.0).abs() < 1e-9);

        let report = std::fs::read_to_string(output.output_filename(SCORESTATS_FILE)).unwrap();
        assert_eq!(report.lines().count(), 3);
        assert!(report.lines().nth(2).unwrap().starts_with("1\t-3.0000"));

        let loads =
            std::fs::read_to_string(output.iteration_filename(1, ROUTE_LOADS_FILE)).unwrap();
        assert!(loads.contains("motorway\t3"));
        assert_eq!(
            population::lock(&population).commuters()[0].score,
            Some(-3.0)
        );
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn scoring_fails_when_iteration_directory_is_missing() {
        let (output, root) = output("missing_dir");
        let population = Population::new(1).shared();
        let listener = ScoringListener::new(
            population,
            output,
            PopulationConfig::default().routes,
            -6.0,
            true,
        );
        assert!(listener
            .notify(&LifecycleEvent::Scoring { iteration: 9 })
            .is_err());
        std::fs::remove_dir_all(&root).ok();
    }
}
