//! ---
//! ivsim_section: "11-simulation"
//! ivsim_subsection: "01-bootstrap"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Simulation runtime module exports and shared types."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
//! Simulated IV infusion device: telemetry model, operating phase lifecycle,
//! shadow property synchronisation and the engine tying them to a transport.

pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod shadow;
pub mod telemetry;

pub use engine::{RunOutcome, RunSummary, SimulationEngine};
pub use error::SimError;
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleStep, PhaseTimingPlan};
pub use shadow::{DeviceProperties, PropertyDelta, ShadowSynchronizer};
pub use telemetry::{
    BatteryTuning, OperatingPhase, TelemetryModel, TelemetryPayload, TelemetrySnapshot,
};
