//! Process-wide panic capture.
//!
//! The panic hook is global to the process, so this binary holds a single
//! test and nothing else installs hooks concurrently.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};

use cyclesim_core::config::OverwritePolicy;
use cyclesim_core::{
    Controller, FaultError, RunError, SimContext, SimulationConfig, SimulationHooks,
};
use cyclesim_types::IterationIndex;

static PREVIOUS_HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);

fn rogue_router() {
    panic!("router index out of bounds");
}

fn late_panic() {
    panic!("after the run");
}

/// Mobsim that starts an unmanaged thread which panics.
struct RogueThreadMobsim;

impl SimulationHooks for RogueThreadMobsim {
    fn run_mobsim(&mut self, _ctx: &SimContext, iteration: IterationIndex) -> anyhow::Result<()> {
        if iteration == 1 {
            let rogue = std::thread::Builder::new()
                .name("rogue-router".to_owned())
                .spawn(rogue_router)?;
            // The panic is reported by the hook, not by this join.
            let _ = rogue.join();
        }
        Ok(())
    }
}

#[test]
fn panics_on_unmanaged_threads_abort_the_run() {
    std::panic::set_hook(Box::new(|_| {
        PREVIOUS_HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
    }));

    let root = std::env::temp_dir().join(format!("cyclesim_panic_hook_{}", std::process::id()));
    let mut config = SimulationConfig::default();
    config.controller.last_iteration = 5;
    config.controller.output_directory = root.clone();
    config.controller.overwrite_files = OverwritePolicy::DeleteDirectoryIfExists;
    config.controller.capture_panics = true;

    let mut ctl = Controller::builder(config)
        .hooks(RogueThreadMobsim)
        .build()
        .unwrap();
    let coordinator = ctl.coordinator();

    let err = ctl.run().unwrap_err();

    let RunError::Fault { origin, source } = err else {
        panic!("expected a fault");
    };
    assert!(origin.contains("rogue-router"));
    match source.as_ref() {
        FaultError::Panic { message, .. } => assert_eq!(message, "router index out of bounds"),
        other => panic!("unexpected fault: {other}"),
    }
    assert_eq!(coordinator.discarded_faults(), 0);
    assert_eq!(PREVIOUS_HOOK_CALLS.load(Ordering::SeqCst), 0);

    // The previous hook is back once the run is over.
    let after = std::thread::spawn(late_panic);
    assert!(after.join().is_err());
    assert_eq!(PREVIOUS_HOOK_CALLS.load(Ordering::SeqCst), 1);

    let _ = std::panic::take_hook();
    std::fs::remove_dir_all(&root).ok();
}
