//! ---
//! ivsim_section: "05-networking-external-interfaces"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Device provisioning and hub transport adapters."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use ivsim_msg::{
    CloudMessage, DeviceMessage, MessagingError, ShadowHandle, TransportEvent, TransportHandle,
};
use ivsim_rt::RateLimiter;
use ivsim_security::DeviceCredentials;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, ETAG};
use reqwest::{Client, StatusCode};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::endpoint::{authority, base_url, ensure_success, service_url};
use crate::provisioning::HubConnection;
use crate::NetError;

/// Device API version spoken by [`HubTransport`].
pub const HUB_API_VERSION: &str = "2020-03-13";

const APP_PROPERTY_PREFIX: &str = "iothub-app-";
const SYSTEM_PROPERTY_PREFIX: &str = "iothub-";
const MESSAGE_ID_HEADER: &str = "iothub-messageid";
const EVENT_CAPACITY: usize = 64;
const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 3;

/// Tuning knobs for the HTTPS hub session.
#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    /// Delay between cloud-to-device polls.
    pub poll_interval: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Lifetime of each signed request token.
    pub sas_ttl: Duration,
}

struct HubInner {
    http: Client,
    base: Url,
    resource: String,
    credentials: DeviceCredentials,
    settings: HubSettings,
    events: broadcast::Sender<TransportEvent>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.abort();
        }
    }
}

/// Hub session over the HTTPS device API.
///
/// Telemetry is posted per message; cloud-to-device messages are fetched by a
/// background poller started on [`TransportHandle::open`]. Repeated poll
/// failures are reported as a disconnect. Device twins are not reachable over
/// this API, so [`TransportHandle::get_shadow`] is unsupported.
pub struct HubTransport {
    inner: Arc<HubInner>,
}

impl HubTransport {
    /// Prepare a session for an assigned hub; nothing is sent until `open`.
    pub fn new(connection: &HubConnection, settings: HubSettings) -> Result<Self, NetError> {
        let http = Client::builder().timeout(settings.request_timeout).build()?;
        let base = base_url(&connection.host)?;
        let resource = format!("{}/devices/{}", authority(&base), connection.device_id);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(HubInner {
                http,
                base,
                resource,
                credentials: DeviceCredentials {
                    device_id: connection.device_id.clone(),
                    device_key: connection.device_key.clone(),
                    derived: false,
                },
                settings,
                events,
                poller: Mutex::new(None),
            }),
        })
    }
}

impl HubInner {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn url(&self, tail: &[&str]) -> Result<Url, NetError> {
        let mut segments = vec!["devices", self.credentials.device_id.as_str(), "messages"];
        segments.extend_from_slice(tail);
        service_url(&self.base, &segments, HUB_API_VERSION)
    }

    fn token(&self) -> Result<String, NetError> {
        let token = self
            .credentials
            .sign(&self.resource, None, self.settings.sas_ttl)?;
        Ok(token.to_string())
    }

    async fn send(&self, message: DeviceMessage) -> Result<(), NetError> {
        let mut request = self
            .http
            .post(self.url(&["events"])?)
            .header(AUTHORIZATION, self.token()?)
            .header(CONTENT_TYPE, message.content_type.as_str())
            .header(MESSAGE_ID_HEADER, message.id.to_string())
            .header("iothub-contenttype", message.content_type.as_str())
            .header("iothub-contentencoding", message.content_encoding.as_str());
        for (key, value) in &message.properties {
            let name = if key.starts_with(SYSTEM_PROPERTY_PREFIX) {
                key.clone()
            } else {
                format!("{APP_PROPERTY_PREFIX}{key}")
            };
            request = request.header(name, value.as_str());
        }
        let response = request.body(message.body).send().await?;
        ensure_success("send", response).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<CloudMessage>, NetError> {
        let response = self
            .http
            .get(self.url(&["deviceBound"])?)
            .header(AUTHORIZATION, self.token()?)
            .send()
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = ensure_success("receive", response).await?;
        let headers = response.headers().clone();
        let lock_token = headers
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_matches('"').to_owned())
            .ok_or_else(|| NetError::Status {
                operation: "receive",
                status: StatusCode::OK.as_u16(),
                body: "message without ETag".to_owned(),
            })?;
        let body = response.bytes().await?.to_vec();
        Ok(Some(CloudMessage {
            message_id: header_text(&headers, MESSAGE_ID_HEADER),
            lock_token,
            body,
            properties: app_properties(&headers),
        }))
    }

    async fn complete(&self, lock_token: &str) -> Result<(), NetError> {
        let response = self
            .http
            .delete(self.url(&["deviceBound", lock_token])?)
            .header(AUTHORIZATION, self.token()?)
            .send()
            .await?;
        ensure_success("complete", response).await?;
        Ok(())
    }
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn app_properties(headers: &HeaderMap) -> IndexMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(APP_PROPERTY_PREFIX)?;
            let value = value.to_str().ok()?;
            Some((key.to_owned(), value.to_owned()))
        })
        .collect()
}

async fn poll_cloud_messages(inner: Weak<HubInner>, interval: Duration) {
    let mut limiter = RateLimiter::new(interval);
    let mut failures = 0;
    loop {
        limiter.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match inner.receive().await {
            Ok(Some(message)) => {
                failures = 0;
                debug!(lock_token = %message.lock_token, "cloud message received");
                inner.emit(TransportEvent::Message(message));
            }
            Ok(None) => failures = 0,
            Err(err) => {
                failures += 1;
                warn!(error = %err, failures, "cloud message poll failed");
                inner.emit(TransportEvent::Error(err.to_string()));
                if failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                    warn!("hub unreachable, reporting disconnect");
                    inner.emit(TransportEvent::Disconnected);
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl TransportHandle for HubTransport {
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    async fn open(&self) -> ivsim_msg::Result<()> {
        let pending = self
            .inner
            .receive()
            .await
            .map_err(|err| MessagingError::Connection(err.to_string()))?;
        info!(hub = %self.inner.base, device_id = %self.inner.credentials.device_id, "hub session open");
        self.inner.emit(TransportEvent::Connected);
        if let Some(message) = pending {
            self.inner.emit(TransportEvent::Message(message));
        }

        let poller = tokio::spawn(poll_cloud_messages(
            Arc::downgrade(&self.inner),
            self.inner.settings.poll_interval,
        ));
        if let Some(previous) = self.inner.poller.lock().replace(poller) {
            previous.abort();
        }
        Ok(())
    }

    async fn send_event(&self, message: DeviceMessage) -> ivsim_msg::Result<()> {
        Ok(self.inner.send(message).await?)
    }

    async fn complete(&self, message: &CloudMessage) -> ivsim_msg::Result<()> {
        Ok(self.inner.complete(&message.lock_token).await?)
    }

    async fn get_shadow(&self) -> ivsim_msg::Result<Arc<dyn ShadowHandle>> {
        Err(MessagingError::Unsupported("device twin over HTTPS"))
    }

    fn name(&self) -> &'static str {
        "hub-https"
    }
}
