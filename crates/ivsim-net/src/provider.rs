//! ---
//! ivsim_section: "05-networking-external-interfaces"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Device provisioning and hub transport adapters."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use ivsim_common::{AppConfig, ConfigError, TransportKind};
use ivsim_msg::{ConnectionProvider, MessagingError, TransportHandle};
use ivsim_security::DeviceCredentials;
use tracing::{debug, info};

use crate::hub::{HubSettings, HubTransport};
use crate::mqtt::{MqttHubTransport, MqttSettings};
use crate::provisioning::ProvisioningClient;
use crate::NetError;

/// Device API used to reach the assigned hub.
#[derive(Debug, Clone, Copy)]
pub enum HubProtocol {
    /// MQTT session with telemetry, cloud messages and the device twin.
    Mqtt(MqttSettings),
    /// HTTPS device API; the twin is not reachable.
    Https(HubSettings),
}

/// Provisions through the device provisioning service, then builds a hub
/// session for the assigned hub.
#[derive(Debug)]
pub struct DpsConnectionProvider {
    credentials: DeviceCredentials,
    model_id: String,
    client: ProvisioningClient,
    protocol: HubProtocol,
}

impl DpsConnectionProvider {
    /// Resolve credentials and build the provisioning client from configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, NetError> {
        let device = &config.device;
        let id_scope = device
            .id_scope
            .as_deref()
            .ok_or(ConfigError::Missing("device.id_scope"))?;
        let credentials = DeviceCredentials::resolve(
            &device.device_id,
            device.device_key.as_deref(),
            device.group_key.as_deref(),
        )?;
        if credentials.derived {
            info!(device_id = %credentials.device_id, "using device key derived from group key");
        }
        let client = ProvisioningClient::new(
            &config.provisioning,
            id_scope,
            config.transport.request_timeout,
        )?;
        let transport = &config.transport;
        let protocol = match transport.kind {
            TransportKind::Https => HubProtocol::Https(HubSettings {
                poll_interval: transport.poll_interval,
                request_timeout: transport.request_timeout,
                sas_ttl: config.provisioning.sas_ttl,
            }),
            TransportKind::Mqtt | TransportKind::Loopback => HubProtocol::Mqtt(MqttSettings {
                port: transport.mqtt_port,
                keep_alive: transport.keep_alive,
                request_timeout: transport.request_timeout,
                sas_ttl: config.provisioning.sas_ttl,
                tls: transport.tls,
            }),
        };
        Ok(Self::new(credentials, device.model_id.clone(), client, protocol))
    }

    /// Assemble a provider from already resolved parts.
    pub fn new(
        credentials: DeviceCredentials,
        model_id: impl Into<String>,
        client: ProvisioningClient,
        protocol: HubProtocol,
    ) -> Self {
        Self {
            credentials,
            model_id: model_id.into(),
            client,
            protocol,
        }
    }
}

#[async_trait]
impl ConnectionProvider for DpsConnectionProvider {
    async fn connect(&self) -> ivsim_msg::Result<Arc<dyn TransportHandle>> {
        let connection = self
            .client
            .register(&self.credentials, &self.model_id)
            .await
            .map_err(|err| MessagingError::Provisioning(err.to_string()))?;
        debug!(connection = %connection, "hub connection string");
        match self.protocol {
            HubProtocol::Mqtt(settings) => Ok(Arc::new(MqttHubTransport::new(&connection, settings)?)),
            HubProtocol::Https(settings) => Ok(Arc::new(HubTransport::new(&connection, settings)?)),
        }
    }

    fn device_id(&self) -> &str {
        &self.credentials.device_id
    }
}
