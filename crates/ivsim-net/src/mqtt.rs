//! ---
//! ivsim_section: "05-networking-external-interfaces"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Device provisioning and hub transport adapters."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use ivsim_msg::{
    CloudMessage, DeviceMessage, MessagingError, PropertyPatch, ShadowHandle, TransportEvent,
    TransportHandle,
};
use ivsim_security::DeviceCredentials;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use serde::Deserialize;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use url::form_urlencoded;

use crate::endpoint::base_url;
use crate::provisioning::HubConnection;
use crate::NetError;

/// Device API version announced in the MQTT user name.
pub const MQTT_API_VERSION: &str = "2021-04-12";

const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const TWIN_DESIRED_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
const TWIN_GET_TOPIC: &str = "$iothub/twin/GET/";
const TWIN_REPORTED_TOPIC: &str = "$iothub/twin/PATCH/properties/reported/";
const MESSAGE_ID_KEY: &str = "$.mid";
const REQUEST_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;
const MAX_PACKET_SIZE: usize = 256 * 1024;

/// Tuning knobs for the MQTT hub session.
#[derive(Debug, Clone, Copy)]
pub struct MqttSettings {
    /// Broker port used when the assigned host carries none.
    pub port: u16,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// Bound on the CONNACK wait and on each twin request.
    pub request_timeout: Duration,
    /// Lifetime of the password token.
    pub sas_ttl: Duration,
    /// Wrap the connection in TLS.
    pub tls: bool,
}

#[derive(Debug)]
struct TwinResponse {
    status: u16,
    body: Vec<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct TwinDocument {
    #[serde(default)]
    desired: PropertyPatch,
}

struct MqttSession {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

struct MqttInner {
    host: String,
    port: u16,
    resource: String,
    credentials: DeviceCredentials,
    settings: MqttSettings,
    events: broadcast::Sender<TransportEvent>,
    desired: broadcast::Sender<PropertyPatch>,
    session: Mutex<Option<MqttSession>>,
    pending: Mutex<HashMap<String, oneshot::Sender<TwinResponse>>>,
    next_request: AtomicU64,
    deliveries: AtomicU64,
}

impl Drop for MqttInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.driver.abort();
        }
    }
}

/// Hub session over the MQTT device API.
///
/// Telemetry goes to `devices/{id}/messages/events/`, cloud-to-device
/// messages arrive on the devicebound topic and are acknowledged by the
/// client's PUBACK, and the device twin is reached through the `$iothub/twin`
/// request/response topics.
pub struct MqttHubTransport {
    inner: Arc<MqttInner>,
}

impl MqttHubTransport {
    /// Prepare a session for an assigned hub; nothing is sent until `open`.
    pub fn new(connection: &HubConnection, settings: MqttSettings) -> Result<Self, NetError> {
        let base = base_url(&connection.host)?;
        let host = base
            .host_str()
            .ok_or(url::ParseError::EmptyHost)?
            .to_owned();
        let port = base.port().unwrap_or(settings.port);
        let resource = format!("{}/devices/{}", host, connection.device_id);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (desired, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(MqttInner {
                host,
                port,
                resource,
                credentials: DeviceCredentials {
                    device_id: connection.device_id.clone(),
                    device_key: connection.device_key.clone(),
                    derived: false,
                },
                settings,
                events,
                desired,
                session: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(0),
                deliveries: AtomicU64::new(0),
            }),
        })
    }
}

impl MqttInner {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn options(&self) -> Result<MqttOptions, NetError> {
        let token = self
            .credentials
            .sign(&self.resource, None, self.settings.sas_ttl)?;
        let user_name = format!(
            "{}/{}/?api-version={}",
            self.host, self.credentials.device_id, MQTT_API_VERSION
        );
        let mut options =
            MqttOptions::new(self.credentials.device_id.clone(), self.host.clone(), self.port);
        options
            .set_credentials(user_name, token.to_string())
            .set_keep_alive(self.settings.keep_alive)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if self.settings.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        Ok(options)
    }

    fn events_topic(&self) -> String {
        format!("devices/{}/messages/events/", self.credentials.device_id)
    }

    fn cloud_prefix(&self) -> String {
        format!("devices/{}/messages/devicebound/", self.credentials.device_id)
    }

    fn client(&self) -> Result<AsyncClient, MessagingError> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or_else(|| MessagingError::Connection("mqtt session is not open".to_owned()))
    }

    fn on_publish(&self, topic: &str, payload: &[u8]) {
        if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
            let Some((status, rid)) = parse_twin_response(rest) else {
                warn!(topic, "malformed twin response topic");
                return;
            };
            match self.pending.lock().remove(&rid) {
                Some(waiter) => {
                    let _ = waiter.send(TwinResponse {
                        status,
                        body: payload.to_vec(),
                    });
                }
                None => debug!(rid = %rid, status, "twin response without a waiter"),
            }
        } else if topic.starts_with(TWIN_DESIRED_PREFIX) {
            match serde_json::from_slice::<PropertyPatch>(payload) {
                Ok(patch) => {
                    debug!(keys = patch.len(), "desired properties patch received");
                    let _ = self.desired.send(patch);
                }
                Err(err) => warn!(error = %err, "desired patch is not a JSON object"),
            }
        } else if let Some(bag) = topic.strip_prefix(self.cloud_prefix().as_str()) {
            let delivery = self.deliveries.fetch_add(1, Ordering::Relaxed);
            let message = cloud_message(bag, payload, delivery);
            debug!(lock_token = %message.lock_token, "cloud message received");
            self.emit(TransportEvent::Message(message));
        } else {
            debug!(topic, "ignoring publish on unexpected topic");
        }
    }

    /// Publish on a twin request topic and wait for the matching response.
    async fn twin_request(&self, topic: &str, body: Vec<u8>) -> Result<TwinResponse, MessagingError> {
        let client = self.client()?;
        let rid = self.next_request.fetch_add(1, Ordering::Relaxed).to_string();
        let (waiter, response) = oneshot::channel();
        self.pending.lock().insert(rid.clone(), waiter);
        let topic = format!("{topic}?$rid={rid}");
        if let Err(err) = client.publish(topic, QoS::AtMostOnce, false, body).await {
            self.pending.lock().remove(&rid);
            return Err(NetError::from(err).into());
        }
        match tokio::time::timeout(self.settings.request_timeout, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MessagingError::Connection(
                "session closed before the twin answered".to_owned(),
            )),
            Err(_) => {
                self.pending.lock().remove(&rid);
                Err(MessagingError::Connection(format!(
                    "twin request {rid} timed out"
                )))
            }
        }
    }

    fn fail_pending(&self) {
        self.pending.lock().clear();
    }
}

/// `{status}/?$rid={rid}[&$version=..]` into its status code and request id.
fn parse_twin_response(rest: &str) -> Option<(u16, String)> {
    let (status, query) = rest.split_once('/')?;
    let status = status.parse().ok()?;
    let query = query.trim_start_matches('?');
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "$rid")
        .map(|(_, rid)| (status, rid.into_owned()))
}

fn cloud_message(bag: &str, payload: &[u8], delivery: u64) -> CloudMessage {
    let mut message_id = None;
    let mut properties = IndexMap::new();
    for (key, value) in form_urlencoded::parse(bag.as_bytes()) {
        if key == MESSAGE_ID_KEY {
            message_id = Some(value.into_owned());
        } else if !key.starts_with("$.") {
            properties.insert(key.into_owned(), value.into_owned());
        }
    }
    CloudMessage {
        lock_token: message_id
            .clone()
            .unwrap_or_else(|| format!("mqtt-{delivery}")),
        message_id,
        body: payload.to_vec(),
        properties,
    }
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Topic suffix carrying system and application properties.
fn property_bag(message: &DeviceMessage) -> String {
    let mut pairs = vec![
        format!("$.ct={}", encode(&message.content_type)),
        format!("$.ce={}", encode(&message.content_encoding)),
        format!("{MESSAGE_ID_KEY}={}", message.id),
    ];
    pairs.extend(
        message
            .properties
            .iter()
            .map(|(key, value)| format!("{}={}", encode(key), encode(value))),
    );
    pairs.join("&")
}

fn expect_status(
    operation: &'static str,
    response: &TwinResponse,
    expected: u16,
) -> Result<(), MessagingError> {
    if response.status == expected {
        return Ok(());
    }
    Err(MessagingError::Rejected {
        operation,
        reason: format!(
            "status {}: {}",
            response.status,
            String::from_utf8_lossy(&response.body)
        ),
    })
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
            debug!(code = ?ack.code, "connack received");
            return Ok(());
        }
    }
}

async fn drive_session(inner: Weak<MqttInner>, mut eventloop: EventLoop) {
    loop {
        let event = eventloop.poll().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                inner.on_publish(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "mqtt session lost");
                inner.fail_pending();
                inner.emit(TransportEvent::Error(err.to_string()));
                inner.emit(TransportEvent::Disconnected);
                return;
            }
        }
    }
}

#[async_trait]
impl TransportHandle for MqttHubTransport {
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    async fn open(&self) -> ivsim_msg::Result<()> {
        let options = self.inner.options()?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let timeout = self.inner.settings.request_timeout;
        match tokio::time::timeout(timeout, await_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(NetError::from(err).into()),
            Err(_) => {
                return Err(MessagingError::Connection(format!(
                    "no CONNACK from {} within {}s",
                    self.inner.host,
                    timeout.as_secs()
                )))
            }
        }

        for filter in [
            format!("{}#", self.inner.cloud_prefix()),
            TWIN_RESPONSE_FILTER.to_owned(),
            TWIN_DESIRED_FILTER.to_owned(),
        ] {
            client
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(NetError::from)?;
        }

        let driver = tokio::spawn(
            drive_session(Arc::downgrade(&self.inner), eventloop).in_current_span(),
        );
        let previous = self
            .inner
            .session
            .lock()
            .replace(MqttSession { client, driver });
        if let Some(previous) = previous {
            previous.driver.abort();
        }
        info!(hub = %self.inner.host, port = self.inner.port, device_id = %self.inner.credentials.device_id, "mqtt session open");
        self.inner.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn send_event(&self, message: DeviceMessage) -> ivsim_msg::Result<()> {
        let client = self.inner.client()?;
        let topic = format!("{}{}", self.inner.events_topic(), property_bag(&message));
        client
            .publish(topic, QoS::AtLeastOnce, false, message.body)
            .await
            .map_err(NetError::from)?;
        Ok(())
    }

    async fn complete(&self, message: &CloudMessage) -> ivsim_msg::Result<()> {
        debug!(lock_token = %message.lock_token, "acknowledged by PUBACK");
        Ok(())
    }

    async fn get_shadow(&self) -> ivsim_msg::Result<Arc<dyn ShadowHandle>> {
        let response = self.inner.twin_request(TWIN_GET_TOPIC, Vec::new()).await?;
        expect_status("twin get", &response, 200)?;
        let document: TwinDocument = serde_json::from_slice(&response.body)?;
        Ok(Arc::new(MqttShadow {
            inner: self.inner.clone(),
            initial: document.desired,
        }))
    }

    fn name(&self) -> &'static str {
        "hub-mqtt"
    }
}

/// Device twin reached through an [`MqttHubTransport`] session.
struct MqttShadow {
    inner: Arc<MqttInner>,
    initial: PropertyPatch,
}

#[async_trait]
impl ShadowHandle for MqttShadow {
    fn desired_changes(&self) -> broadcast::Receiver<PropertyPatch> {
        self.inner.desired.subscribe()
    }

    async fn report_properties(&self, patch: PropertyPatch) -> ivsim_msg::Result<()> {
        let body = serde_json::to_vec(&patch)?;
        let response = self.inner.twin_request(TWIN_REPORTED_TOPIC, body).await?;
        expect_status("twin report", &response, 204)
    }

    fn initial_desired(&self) -> Option<PropertyPatch> {
        Some(self.initial.clone())
    }
}
