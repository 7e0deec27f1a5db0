//! ---
//! ivsim_section: "05-networking-external-interfaces"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Device provisioning and hub transport adapters."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use ivsim_common::ConfigError;
use ivsim_msg::MessagingError;
use ivsim_security::CredentialError;

/// Failures raised while talking to the provisioning service or the hub.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Transport level HTTP failure.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// An endpoint could not be assembled.
    #[error("invalid endpoint: {0}")]
    Url(#[from] url::ParseError),
    /// Required settings were absent or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Signing material was unusable.
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    /// The service answered with an unexpected status code.
    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        /// Operation being performed.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// The MQTT client rejected a request.
    #[error("mqtt request failed: {0}")]
    MqttClient(#[from] rumqttc::ClientError),
    /// The MQTT session could not be established or was lost.
    #[error("mqtt connection failed: {0}")]
    MqttConnection(#[from] rumqttc::ConnectionError),
    /// Registration finished without an assignment.
    #[error("registration failed: {0}")]
    Registration(String),
}

impl From<NetError> for MessagingError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Status {
                operation,
                status,
                body,
            } => MessagingError::Rejected {
                operation,
                reason: format!("HTTP {status}: {body}"),
            },
            NetError::Registration(reason) => MessagingError::Provisioning(reason),
            other => MessagingError::Connection(other.to_string()),
        }
    }
}
