//! Health/Idle Watchdog
//!
//! One periodic loop driving both recovery policies: crash detection
//! (OS-level liveness of every running process) and idle reaping. Both
//! operate purely on the supervisor's state machine; the loop itself owns
//! no state.

use tokio::time::MissedTickBehavior;

use crate::supervisor::Supervisor;

/// Spawn the watchdog loop. It runs until the returned task is aborted.
pub fn spawn(supervisor: Supervisor) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(supervisor))
}

async fn run(supervisor: Supervisor) {
    let mut interval = tokio::time::interval(supervisor.fleet_config().watchdog_interval());
    // A late tick should not cause a burst of catch-up sweeps.
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        supervisor.sweep_liveness().await;
        supervisor.reap_idle().await;
    }
}
