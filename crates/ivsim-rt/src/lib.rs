//! ---
//! ivsim_section: "01-core-functionality"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Runtime helpers supporting the simulation engine."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
//! Tick pacing and one-shot timers for the simulator runtime.

pub mod scheduling;

pub use scheduling::{RateLimiter, TimerSet, TimerToken};
