use crate::automation::Controller;
use crate::error::ControlError;
use log::{debug, info, warn};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;

/// When the first pass runs after `start()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstPass {
    #[default]
    Immediate,
    AfterInterval,
}

/// Manages timing of periodic automation passes.
pub struct Scheduler {
    tick_count: u64,
    first_pass: FirstPass,
}

impl Scheduler {
    pub fn new(first_pass: FirstPass) -> Self {
        Self {
            tick_count: 0,
            first_pass,
        }
    }

    pub fn tick(&mut self) {
        self.tick_count += 1;
    }

    /// How long to sleep before the next pass. The interval is passed in
    /// on every call so config changes apply from the next sleep.
    pub fn delay_before_next(&self, interval: Duration) -> Duration {
        if self.owes_first_pass() {
            return Duration::ZERO;
        }
        interval
    }

    /// True until the immediate first pass has been attempted.
    pub fn owes_first_pass(&self) -> bool {
        self.tick_count == 0 && self.first_pass == FirstPass::Immediate
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}

/// Scheduler task of one `start()`..`stop()` cycle.
///
/// Exits when `shutdown` flips or its sender goes away. A pass already in
/// flight when that happens is allowed to finish. An immediate first pass
/// that finds another pass running (the one left over from before a quick
/// stop/start) waits for it and runs right after.
pub async fn run(controller: Controller, generation: u64, mut shutdown: watch::Receiver<bool>) {
    let mut sched = Scheduler::new(controller.first_pass());

    loop {
        let interval = Duration::from_secs(controller.config().update_interval_secs);
        let delay = sched.delay_before_next(interval);
        controller.schedule_next(generation, delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let mut outcome = controller.run_once().await;
        if matches!(outcome, Err(ControlError::PassInProgress)) && sched.owes_first_pass() {
            info!("Scheduler: first pass waits for the pass in progress");
            tokio::select! {
                _ = controller.wait_until_idle() => {},
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            outcome = controller.run_once().await;
        }

        match outcome {
            Ok(result) => debug!(
                "Scheduler: tick {} done ({} applied)",
                sched.tick_count(),
                result.applied
            ),
            Err(ControlError::PassInProgress) => info!(
                "Scheduler: tick {} skipped, a pass is already in progress",
                sched.tick_count()
            ),
            Err(e) => warn!("Scheduler: tick {} failed: {}", sched.tick_count(), e),
        }

        sched.tick();
    }

    debug!("Scheduler: generation {} stopped", generation);
}
