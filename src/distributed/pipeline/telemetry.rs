//! Named timers and the pipeline-stall barrier.
//!
//! Schedulers bracket compute and communication with `start` / `stop` calls
//! under fixed names (see [`timer`]). Nothing in a schedule depends on what a
//! [`Telemetry`] implementation does with them.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Timer names used by the schedulers.
pub mod timer {
    pub const FORWARD_COMPUTE: &str = "forward-compute";
    pub const BACKWARD_COMPUTE: &str = "backward-compute";
    pub const FORWARD_RECV: &str = "forward-recv";
    pub const FORWARD_SEND: &str = "forward-send";
    pub const BACKWARD_RECV: &str = "backward-recv";
    pub const BACKWARD_SEND: &str = "backward-send";
    pub const FORWARD_SEND_BACKWARD_RECV: &str = "forward-send-backward-recv";
    pub const BACKWARD_SEND_FORWARD_RECV: &str = "backward-send-forward-recv";
    pub const FORWARD_SEND_FORWARD_RECV: &str = "forward-send-forward-recv";
    pub const BACKWARD_SEND_BACKWARD_RECV: &str = "backward-send-backward-recv";
    pub const FORWARD_BACKWARD_SEND_FORWARD_BACKWARD_RECV: &str =
        "forward-backward-send-forward-backward-recv";
    pub const FORWARD_PIPELINE_STALL: &str = "forward-pipeline-stall";
}

/// Timing hooks. Every method defaults to a no-op.
pub trait Telemetry {
    fn start(&mut self, _name: &str) {}

    fn stop(&mut self, _name: &str) {}

    /// Rendezvous with the other ranks so the following timer measures the
    /// pipeline stall rather than skew between ranks.
    fn barrier(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// Reusable rendezvous of `parties` threads whose wait can time out.
#[derive(Debug)]
pub struct StallBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl StallBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Block until every party has arrived, or fail once `timeout` elapses.
    /// A party that times out withdraws from the current round.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        state.arrived += 1;
        if state.arrived >= self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }

        let generation = state.generation;
        let deadline = timeout.map(|t| Instant::now() + t);
        while state.generation == generation {
            let Some(deadline) = deadline else {
                state = self.released.wait(state).map_err(|_| poisoned())?;
                continue;
            };
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                let arrived = state.arrived;
                state.arrived -= 1;
                tracing::error!(arrived, parties = self.parties, "stall barrier timed out");
                return Err(Error::DistributedError {
                    reason: format!(
                        "stall barrier timed out with {arrived} of {} parties arrived",
                        self.parties
                    ),
                });
            };
            state = self
                .released
                .wait_timeout(state, remaining)
                .map_err(|_| poisoned())?
                .0;
        }
        Ok(())
    }
}

fn poisoned() -> Error {
    Error::DistributedError {
        reason: "stall barrier poisoned".to_string(),
    }
}

/// Accumulated time of one named timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    pub elapsed: Duration,
    /// Completed start/stop pairs.
    pub count: usize,
}

/// Wall-clock timers keyed by name.
#[derive(Debug, Default)]
pub struct Timers {
    stats: HashMap<String, TimerStats>,
    running: HashMap<String, Instant>,
    barrier: Option<Arc<StallBarrier>>,
    barrier_timeout: Option<Duration>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait on `barrier` whenever a scheduler asks for a stall barrier.
    pub fn with_barrier(mut self, barrier: Arc<StallBarrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    /// Fail a stall barrier that waits longer than `timeout`.
    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = Some(timeout);
        self
    }

    pub fn get(&self, name: &str) -> Option<TimerStats> {
        self.stats.get(name).copied()
    }

    pub fn elapsed(&self, name: &str) -> Duration {
        self.get(name).map(|s| s.elapsed).unwrap_or_default()
    }

    /// Timer names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.stats.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn reset(&mut self) {
        self.stats.clear();
        self.running.clear();
    }
}

impl Telemetry for Timers {
    fn start(&mut self, name: &str) {
        if self
            .running
            .insert(name.to_string(), Instant::now())
            .is_some()
        {
            tracing::warn!(timer = name, "timer restarted before it was stopped");
        }
    }

    fn stop(&mut self, name: &str) {
        let Some(started) = self.running.remove(name) else {
            tracing::warn!(timer = name, "timer stopped without being started");
            return;
        };
        let entry = self.stats.entry(name.to_string()).or_default();
        entry.elapsed += started.elapsed();
        entry.count += 1;
    }

    fn barrier(&mut self) -> Result<()> {
        match &self.barrier {
            Some(barrier) => barrier.wait(self.barrier_timeout),
            None => Ok(()),
        }
    }
}
