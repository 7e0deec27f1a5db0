//! ---
//! ivsim_section: "11-simulation"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Failures that end a simulation run."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use ivsim_common::ConfigError;
use ivsim_msg::MessagingError;

/// Fatal errors. Transport failures during a run are logged, not returned.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// No transport could be obtained; nothing was scheduled.
    #[error("startup failed for device {device_id}: {source}")]
    Startup {
        device_id: String,
        #[source]
        source: MessagingError,
    },
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
}
