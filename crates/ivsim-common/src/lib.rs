//! ---
//! ivsim_section: "01-core-functionality"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Shared primitives and utilities for the simulator runtime."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
//! Shared primitives for the IV2Go simulator workspace.
//! This crate exposes configuration loading and logging setup consumed by the
//! simulation engine and the `ivsimd` binary.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, ConfigError, DeviceConfig, LoadedAppConfig, LoggingConfig, ProvisioningConfig,
    SimulationConfig, TransportConfig, TransportKind,
};
pub use logging::{init_tracing, LogFormat};
