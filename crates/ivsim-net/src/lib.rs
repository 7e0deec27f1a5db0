//! ---
//! ivsim_section: "05-networking-external-interfaces"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Device provisioning and hub transport adapters."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Network edge of the simulator: registers the device with the provisioning
//! service and talks to the assigned hub over its MQTT device API (device
//! twin included) or its HTTPS device API.

mod endpoint;
pub mod error;
pub mod hub;
pub mod mqtt;
pub mod provider;
pub mod provisioning;

pub use error::NetError;
pub use hub::{HubSettings, HubTransport, HUB_API_VERSION};
pub use mqtt::{MqttHubTransport, MqttSettings, MQTT_API_VERSION};
pub use provider::{DpsConnectionProvider, HubProtocol};
pub use provisioning::{HubConnection, ProvisioningClient};
