//! Single background sweep over all tracked endpoints.
//!
//! The task ticks only while at least one endpoint is limited and parks on
//! the tracker's limited signal otherwise. Dropping the `SweepHandle` aborts
//! the task.

use crate::tracker::{lock_tracker, SharedTracker};
use log::debug;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Owns the sweep task. The task is aborted when the handle is dropped.
#[derive(Debug)]
pub struct SweepHandle {
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Abort the task and wait for it to wind down.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawn the sweep loop on the current tokio runtime.
pub fn spawn_sweeper(tracker: SharedTracker, period: Duration) -> SweepHandle {
    let signal = lock_tracker(&tracker).limited_signal();
    let task = tokio::spawn(async move {
        loop {
            let idle = !lock_tracker(&tracker).any_limited();
            if idle {
                debug!("sweep parked: no limited endpoints");
                signal.notified().await;
                continue;
            }

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let still_limited = {
                    let mut t = lock_tracker(&tracker);
                    t.sweep();
                    t.any_limited()
                };
                if !still_limited {
                    break;
                }
            }
        }
    });
    SweepHandle { task: Some(task) }
}
