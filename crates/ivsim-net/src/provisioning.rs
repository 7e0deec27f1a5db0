//! ---
//! ivsim_section: "05-networking-external-interfaces"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Device provisioning and hub transport adapters."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use ivsim_common::ProvisioningConfig;
use ivsim_security::DeviceCredentials;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::endpoint::{authority, base_url, ensure_success, retry_after, service_url};
use crate::NetError;

const REGISTRATION_KEY_NAME: &str = "registration";
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Hub assignment returned by the provisioning service.
#[derive(Clone, PartialEq, Eq)]
pub struct HubConnection {
    /// Assigned hub host name.
    pub host: String,
    /// Device identity on the hub.
    pub device_id: String,
    /// Symmetric key the device authenticates with.
    pub device_key: String,
}

impl HubConnection {
    /// Full `HostName=..;DeviceId=..;SharedAccessKey=..` connection string.
    pub fn connection_string(&self) -> String {
        format!(
            "HostName={};DeviceId={};SharedAccessKey={}",
            self.host, self.device_id, self.device_key
        )
    }
}

impl fmt::Display for HubConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HostName={};DeviceId={};SharedAccessKey=<redacted>",
            self.host, self.device_id
        )
    }
}

impl fmt::Debug for HubConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConnection")
            .field("host", &self.host)
            .field("device_id", &self.device_id)
            .field("device_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationRequest<'a> {
    registration_id: &'a str,
    payload: RegistrationPayload<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationPayload<'a> {
    iotc_model_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationStatus {
    #[serde(default)]
    operation_id: Option<String>,
    status: String,
    #[serde(default)]
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    #[serde(default)]
    assigned_hub: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

/// Client for the provisioning service's symmetric-key registration API.
#[derive(Debug, Clone)]
pub struct ProvisioningClient {
    http: Client,
    base: Url,
    id_scope: String,
    api_version: String,
    max_poll_attempts: u32,
    sas_ttl: Duration,
    retry_delay: Duration,
}

impl ProvisioningClient {
    /// Build a client for `id_scope` against the configured global endpoint.
    pub fn new(
        config: &ProvisioningConfig,
        id_scope: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, NetError> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base: base_url(&config.global_endpoint)?,
            id_scope: id_scope.into(),
            api_version: config.api_version.clone(),
            max_poll_attempts: config.max_poll_attempts,
            sas_ttl: config.sas_ttl,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// Poll delay used when the service sends no `Retry-After` header.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Register the device and wait for its hub assignment.
    pub async fn register(
        &self,
        credentials: &DeviceCredentials,
        model_id: &str,
    ) -> Result<HubConnection, NetError> {
        let device_id = credentials.device_id.as_str();
        info!(device_id, id_scope = %self.id_scope, "starting device registration");

        let request = RegistrationRequest {
            registration_id: device_id,
            payload: RegistrationPayload {
                iotc_model_id: model_id,
            },
        };
        let url = service_url(
            &self.base,
            &[self.id_scope.as_str(), "registrations", device_id, "register"],
            &self.api_version,
        )?;
        let response = self
            .http
            .put(url)
            .header(AUTHORIZATION, self.token(credentials)?)
            .json(&request)
            .send()
            .await?;
        let (mut operation, mut delay) = self.read_operation("register", response).await?;

        let mut polls = 0;
        loop {
            let status = std::mem::take(&mut operation.status);
            debug!(device_id, status = %status, polls, "registration status");
            match status.as_str() {
                "assigned" => return self.assignment(credentials, operation),
                "assigning" | "unassigned" => {}
                other => {
                    let reason = operation
                        .registration_state
                        .and_then(|state| state.error_message)
                        .unwrap_or_default();
                    return Err(NetError::Registration(format!("status {other}: {reason}")));
                }
            }
            if polls >= self.max_poll_attempts {
                return Err(NetError::Registration(format!(
                    "no assignment after {polls} status polls"
                )));
            }
            let operation_id = operation
                .operation_id
                .take()
                .ok_or_else(|| NetError::Registration("missing operationId".to_owned()))?;
            tokio::time::sleep(delay).await;
            polls += 1;

            let url = service_url(
                &self.base,
                &[
                    self.id_scope.as_str(),
                    "registrations",
                    device_id,
                    "operations",
                    operation_id.as_str(),
                ],
                &self.api_version,
            )?;
            let response = self
                .http
                .get(url)
                .header(AUTHORIZATION, self.token(credentials)?)
                .send()
                .await?;
            (operation, delay) = self.read_operation("operation status", response).await?;
        }
    }

    fn token(&self, credentials: &DeviceCredentials) -> Result<String, NetError> {
        let resource = format!("{}/registrations/{}", self.id_scope, credentials.device_id);
        let token = credentials.sign(&resource, Some(REGISTRATION_KEY_NAME), self.sas_ttl)?;
        Ok(token.to_string())
    }

    async fn read_operation(
        &self,
        operation: &'static str,
        response: Response,
    ) -> Result<(OperationStatus, Duration), NetError> {
        let delay = retry_after(response.headers()).unwrap_or(self.retry_delay);
        let response = ensure_success(operation, response).await?;
        Ok((response.json::<OperationStatus>().await?, delay))
    }

    fn assignment(
        &self,
        credentials: &DeviceCredentials,
        operation: OperationStatus,
    ) -> Result<HubConnection, NetError> {
        let state = operation
            .registration_state
            .ok_or_else(|| NetError::Registration("assigned without registrationState".to_owned()))?;
        let host = state
            .assigned_hub
            .ok_or_else(|| NetError::Registration("assigned without assignedHub".to_owned()))?;
        let connection = HubConnection {
            host,
            device_id: state
                .device_id
                .unwrap_or_else(|| credentials.device_id.clone()),
            device_key: credentials.device_key.clone(),
        };
        info!(
            hub = %connection.host,
            device_id = %connection.device_id,
            provisioning = %authority(&self.base),
            "registration succeeded"
        );
        Ok(connection)
    }
}
