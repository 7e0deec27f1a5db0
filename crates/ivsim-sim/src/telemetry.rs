//! ---
//! ivsim_section: "11-simulation"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Infusion device telemetry model and wire payload."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use ivsim_common::SimulationConfig;
use rand::prelude::*;
use serde::{Deserialize, Serialize};

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Operating phase of the device, embedded in every telemetry message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingPhase {
    #[default]
    Idle,
    Active,
    Charging,
    Finished,
}

impl OperatingPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            OperatingPhase::Idle => "idle",
            OperatingPhase::Active => "active",
            OperatingPhase::Charging => "charging",
            OperatingPhase::Finished => "finished",
        }
    }

    /// Phase that legally follows this one.
    pub fn successor(self) -> Option<Self> {
        match self {
            OperatingPhase::Idle => Some(OperatingPhase::Active),
            OperatingPhase::Active => Some(OperatingPhase::Charging),
            OperatingPhase::Charging => Some(OperatingPhase::Finished),
            OperatingPhase::Finished => None,
        }
    }
}

impl fmt::Display for OperatingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-tick battery deltas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryTuning {
    pub drain_per_tick: f64,
    pub charge_per_tick: f64,
}

impl Default for BatteryTuning {
    fn default() -> Self {
        Self {
            drain_per_tick: 0.02,
            charge_per_tick: 0.25,
        }
    }
}

/// Evolving device quantities. Nothing here is clamped.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySnapshot {
    /// Diagnostics counter, bumped once per emitted message.
    pub message_tracking_id: u64,
    pub battery_level: f64,
    /// Seconds; may go negative once the bag is overrun.
    pub time_left_of_treatment: i64,
    pub liquid_left_in_bag: f64,
    /// mL per hour.
    pub flowrate: f64,
    pub system_state: OperatingPhase,
}

/// JSON body sent each tick. Field order is the wire order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    pub battery_level: i64,
    pub system_state: OperatingPhase,
    pub time_left_of_treatment: i64,
    pub liquid_left_in_bag: i64,
    pub flowrate: f64,
}

impl From<&TelemetrySnapshot> for TelemetryPayload {
    fn from(snapshot: &TelemetrySnapshot) -> Self {
        Self {
            battery_level: snapshot.battery_level.round() as i64,
            system_state: snapshot.system_state,
            time_left_of_treatment: snapshot.time_left_of_treatment,
            liquid_left_in_bag: snapshot.liquid_left_in_bag.round() as i64,
            flowrate: snapshot.flowrate,
        }
    }
}

/// Owns the snapshot and the arithmetic that advances it.
#[derive(Debug, Clone)]
pub struct TelemetryModel {
    snapshot: TelemetrySnapshot,
    tuning: BatteryTuning,
}

impl TelemetryModel {
    pub fn new(battery_level: f64, bag_size_ml: f64, flowrate: f64, tuning: BatteryTuning) -> Self {
        let mut model = Self {
            snapshot: TelemetrySnapshot {
                message_tracking_id: 0,
                battery_level,
                time_left_of_treatment: 0,
                liquid_left_in_bag: bag_size_ml,
                flowrate,
                system_state: OperatingPhase::Idle,
            },
            tuning,
        };
        model.recompute_time_left();
        model
    }

    /// Build from configuration with a battery level drawn from `[60, 100)`.
    pub fn from_config(config: &SimulationConfig) -> Self {
        let mut rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let battery_level = 60.0 + rng.gen::<f64>() * 40.0;
        Self::new(
            battery_level,
            config.bag_size_ml,
            config.flowrate_ml_per_hour,
            BatteryTuning {
                drain_per_tick: config.battery_drain_per_tick,
                charge_per_tick: config.battery_charge_per_tick,
            },
        )
    }

    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    pub fn phase(&self) -> OperatingPhase {
        self.snapshot.system_state
    }

    pub fn set_phase(&mut self, phase: OperatingPhase) {
        self.snapshot.system_state = phase;
    }

    /// Refill to `bag_size_ml` and re-derive the remaining treatment time.
    pub fn set_bag_size(&mut self, bag_size_ml: f64) {
        self.snapshot.liquid_left_in_bag = bag_size_ml;
        self.recompute_time_left();
    }

    pub fn set_flowrate(&mut self, flowrate: f64) {
        self.snapshot.flowrate = flowrate;
        self.recompute_time_left();
    }

    /// `round(liquid / flowrate * 3600)`; only the setters call this.
    pub fn recompute_time_left(&mut self) {
        let seconds =
            self.snapshot.liquid_left_in_bag / self.snapshot.flowrate * SECONDS_PER_HOUR;
        self.snapshot.time_left_of_treatment = seconds.round() as i64;
    }

    pub fn advance_one_tick(&mut self, interval: Duration) -> &TelemetrySnapshot {
        let snapshot = &mut self.snapshot;
        snapshot.message_tracking_id += 1;
        if snapshot.system_state == OperatingPhase::Charging {
            snapshot.battery_level += self.tuning.charge_per_tick;
        } else {
            snapshot.battery_level -= self.tuning.drain_per_tick;
        }
        let elapsed = i64::try_from(interval.as_secs()).unwrap_or(i64::MAX);
        snapshot.time_left_of_treatment = snapshot.time_left_of_treatment.saturating_sub(elapsed);
        snapshot.liquid_left_in_bag -= snapshot.flowrate / SECONDS_PER_HOUR * interval.as_secs_f64();
        snapshot
    }

    pub fn payload(&self) -> TelemetryPayload {
        TelemetryPayload::from(&self.snapshot)
    }

    /// Encode the current payload as compact JSON.
    pub fn serialize(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.payload())
    }
}
