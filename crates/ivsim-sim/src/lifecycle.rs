//! ---
//! ivsim_section: "11-simulation"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Operating phase state machine and its timing plan."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::time::Duration;

use crate::telemetry::OperatingPhase;

/// Timer payloads driving the phase chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStep {
    Enter(OperatingPhase),
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("cannot move from {from} to {to}")]
    OutOfOrder {
        from: OperatingPhase,
        to: OperatingPhase,
    },
    #[error("cannot terminate while {0}")]
    NotFinished(OperatingPhase),
    #[error("lifecycle already terminated")]
    Terminated,
}

/// Phase durations in whole seconds.
///
/// The active duration is whatever treatment time remains after the charging
/// window and one final tick, so it is negative for short treatments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimingPlan {
    pub idle_secs: u64,
    pub charging_secs: u64,
    pub tick_secs: u64,
    pub active_secs: i64,
}

impl PhaseTimingPlan {
    pub fn new(idle: Duration, charging: Duration, tick: Duration, time_left_secs: i64) -> Self {
        let charging_secs = charging.as_secs();
        let tick_secs = tick.as_secs();
        let reserved = i64::try_from(charging_secs.saturating_add(tick_secs)).unwrap_or(i64::MAX);
        Self {
            idle_secs: idle.as_secs(),
            charging_secs,
            tick_secs,
            active_secs: time_left_secs.saturating_sub(reserved),
        }
    }

    /// Delay for the active phase; a negative duration schedules immediately.
    pub fn active_delay(&self) -> Duration {
        Duration::from_secs(self.active_secs.max(0) as u64)
    }

    /// Steps with their offsets from the moment the plan is armed.
    pub fn schedule(&self) -> [(Duration, LifecycleStep); 4] {
        let active_at = Duration::from_secs(self.idle_secs);
        let charging_at = active_at.saturating_add(self.active_delay());
        let finished_at = charging_at.saturating_add(Duration::from_secs(self.charging_secs));
        let terminate_at = finished_at.saturating_add(Duration::from_secs(self.tick_secs));
        [
            (active_at, LifecycleStep::Enter(OperatingPhase::Active)),
            (charging_at, LifecycleStep::Enter(OperatingPhase::Charging)),
            (finished_at, LifecycleStep::Enter(OperatingPhase::Finished)),
            (terminate_at, LifecycleStep::Terminate),
        ]
    }
}

/// Forward-only phase tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    phase: OperatingPhase,
    history: Vec<OperatingPhase>,
    terminated: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: OperatingPhase::Idle,
            history: vec![OperatingPhase::Idle],
            terminated: false,
        }
    }

    pub fn phase(&self) -> OperatingPhase {
        self.phase
    }

    /// Every phase entered so far, starting with idle.
    pub fn history(&self) -> &[OperatingPhase] {
        &self.history
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Move to `to` if it directly follows the current phase.
    pub fn advance(&mut self, to: OperatingPhase) -> Result<OperatingPhase, LifecycleError> {
        if self.terminated {
            return Err(LifecycleError::Terminated);
        }
        if self.phase.successor() != Some(to) {
            return Err(LifecycleError::OutOfOrder {
                from: self.phase,
                to,
            });
        }
        let previous = self.phase;
        self.phase = to;
        self.history.push(to);
        Ok(previous)
    }

    pub fn terminate(&mut self) -> Result<(), LifecycleError> {
        if self.terminated {
            return Err(LifecycleError::Terminated);
        }
        if self.phase != OperatingPhase::Finished {
            return Err(LifecycleError::NotFinished(self.phase));
        }
        self.terminated = true;
        Ok(())
    }
}
