//! ---
//! ivsim_section: "02-messaging-transport"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Message envelopes and transport contracts."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{CloudMessage, DeviceMessage, PropertyPatch, TransportEvent};
use crate::{MessagingError, Result};

const EVENT_CAPACITY: usize = 64;

/// Session with a telemetry backend.
///
/// Implementations publish session notifications on the channel returned by
/// [`TransportHandle::subscribe`]; callers subscribe before calling
/// [`TransportHandle::open`] so the initial `Connected` event is not missed.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Subscribe to connect/disconnect/message/error notifications.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    /// Open (or reopen) the session.
    async fn open(&self) -> Result<()>;
    /// Send a device-to-cloud message.
    async fn send_event(&self, message: DeviceMessage) -> Result<()>;
    /// Acknowledge a cloud-to-device message.
    async fn complete(&self, message: &CloudMessage) -> Result<()>;
    /// Obtain the device's shadow document.
    async fn get_shadow(&self) -> Result<Arc<dyn ShadowHandle>>;
    /// Human-readable transport name for logging.
    fn name(&self) -> &'static str;
}

/// Desired/reported property document held by the service.
#[async_trait]
pub trait ShadowHandle: Send + Sync {
    /// Subscribe to desired-property patches pushed by the service.
    fn desired_changes(&self) -> broadcast::Receiver<PropertyPatch>;
    /// Publish a reported-property patch.
    async fn report_properties(&self, patch: PropertyPatch) -> Result<()>;
    /// Desired section as it stood when the document was fetched.
    fn initial_desired(&self) -> Option<PropertyPatch> {
        None
    }
}

/// Yields a transport for a provisioned device identity.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Provision the device and hand back a ready-to-open transport.
    async fn connect(&self) -> Result<Arc<dyn TransportHandle>>;
    /// Identity the provider connects as.
    fn device_id(&self) -> &str;
}

#[derive(Default)]
struct TransportState {
    sent: Vec<DeviceMessage>,
    completed: Vec<String>,
    open_calls: usize,
    failing_sends: usize,
    failing_opens: usize,
}

struct TransportInner {
    events: broadcast::Sender<TransportEvent>,
    state: Mutex<TransportState>,
    shadow: Option<InMemoryShadow>,
}

/// In-memory transport that records traffic and lets callers inject events.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<TransportInner>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// Create a transport whose shadow is available.
    pub fn new() -> Self {
        Self::build(Some(InMemoryShadow::new()))
    }

    /// Create a transport that fails every shadow request.
    pub fn without_shadow() -> Self {
        Self::build(None)
    }

    fn build(shadow: Option<InMemoryShadow>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(TransportInner {
                events,
                state: Mutex::new(TransportState::default()),
                shadow,
            }),
        }
    }

    /// Publish an event to every subscriber.
    pub fn emit(&self, event: TransportEvent) {
        debug!(kind = event.kind(), "loopback transport emitting event");
        let _ = self.inner.events.send(event);
    }

    /// Make the next `count` sends fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.inner.state.lock().failing_sends = count;
    }

    /// Make the next `count` opens fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.inner.state.lock().failing_opens = count;
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<DeviceMessage> {
        self.inner.state.lock().sent.clone()
    }

    /// Lock tokens of completed cloud-to-device messages.
    pub fn completed(&self) -> Vec<String> {
        self.inner.state.lock().completed.clone()
    }

    /// Number of `open` calls observed, successful or not.
    pub fn open_calls(&self) -> usize {
        self.inner.state.lock().open_calls
    }

    /// Shadow backing this transport, if any.
    pub fn shadow(&self) -> Option<InMemoryShadow> {
        self.inner.shadow.clone()
    }
}

#[async_trait]
impl TransportHandle for InMemoryTransport {
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    async fn open(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            state.open_calls += 1;
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(MessagingError::Connection("injected open failure".to_owned()));
            }
        }
        self.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn send_event(&self, message: DeviceMessage) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(MessagingError::Rejected {
                operation: "send",
                reason: "injected send failure".to_owned(),
            });
        }
        state.sent.push(message);
        Ok(())
    }

    async fn complete(&self, message: &CloudMessage) -> Result<()> {
        self.inner
            .state
            .lock()
            .completed
            .push(message.lock_token.clone());
        Ok(())
    }

    async fn get_shadow(&self) -> Result<Arc<dyn ShadowHandle>> {
        match &self.inner.shadow {
            Some(shadow) => Ok(Arc::new(shadow.clone())),
            None => Err(MessagingError::Unsupported("shadow")),
        }
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

#[derive(Default)]
struct ShadowState {
    reported: Vec<PropertyPatch>,
    failing_reports: usize,
}

struct ShadowInner {
    desired: broadcast::Sender<PropertyPatch>,
    state: Mutex<ShadowState>,
}

/// In-memory shadow document recording every reported patch.
#[derive(Clone)]
pub struct InMemoryShadow {
    inner: Arc<ShadowInner>,
}

impl Default for InMemoryShadow {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryShadow {
    /// Create an empty shadow.
    pub fn new() -> Self {
        let (desired, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ShadowInner {
                desired,
                state: Mutex::new(ShadowState::default()),
            }),
        }
    }

    /// Simulate an operator updating desired properties.
    pub fn push_desired(&self, patch: PropertyPatch) {
        let _ = self.inner.desired.send(patch);
    }

    /// Every reported patch in arrival order.
    pub fn reported(&self) -> Vec<PropertyPatch> {
        self.inner.state.lock().reported.clone()
    }

    /// Reported section as the service would hold it (later patches win).
    pub fn reported_document(&self) -> PropertyPatch {
        let state = self.inner.state.lock();
        let mut document = PropertyPatch::new();
        for patch in &state.reported {
            for (key, value) in patch {
                document.insert(key.clone(), value.clone());
            }
        }
        document
    }

    /// Make the next `count` reports fail.
    pub fn fail_next_reports(&self, count: usize) {
        self.inner.state.lock().failing_reports = count;
    }
}

#[async_trait]
impl ShadowHandle for InMemoryShadow {
    fn desired_changes(&self) -> broadcast::Receiver<PropertyPatch> {
        self.inner.desired.subscribe()
    }

    async fn report_properties(&self, patch: PropertyPatch) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.failing_reports > 0 {
            state.failing_reports -= 1;
            return Err(MessagingError::Rejected {
                operation: "report",
                reason: "injected report failure".to_owned(),
            });
        }
        state.reported.push(patch);
        Ok(())
    }
}

/// Connection provider handing out a single loopback transport.
#[derive(Clone)]
pub struct LoopbackProvider {
    device_id: String,
    transport: InMemoryTransport,
    fail: bool,
}

impl LoopbackProvider {
    /// Provider that always yields `transport`.
    pub fn new(device_id: impl Into<String>, transport: InMemoryTransport) -> Self {
        Self {
            device_id: device_id.into(),
            transport,
            fail: false,
        }
    }

    /// Provider whose `connect` always fails.
    pub fn unreachable(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            transport: InMemoryTransport::new(),
            fail: true,
        }
    }

    /// The transport handed out by `connect`.
    pub fn transport(&self) -> &InMemoryTransport {
        &self.transport
    }
}

#[async_trait]
impl ConnectionProvider for LoopbackProvider {
    async fn connect(&self) -> Result<Arc<dyn TransportHandle>> {
        if self.fail {
            return Err(MessagingError::Provisioning(format!(
                "loopback backend unreachable for {}",
                self.device_id
            )));
        }
        Ok(Arc::new(self.transport.clone()))
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn open_publishes_connected_to_subscribers() {
        let transport = InMemoryTransport::new();
        let mut events = transport.subscribe();
        transport.open().await.expect("open succeeds");
        assert_eq!(events.recv().await.expect("event"), TransportEvent::Connected);
        assert_eq!(transport.open_calls(), 1);
    }

    #[tokio::test]
    async fn injected_send_failures_are_consumed_in_order() {
        let transport = InMemoryTransport::new();
        transport.fail_next_sends(1);
        let first = transport
            .send_event(DeviceMessage::json(b"1".to_vec()))
            .await;
        assert!(matches!(
            first,
            Err(MessagingError::Rejected { operation: "send", .. })
        ));
        transport
            .send_event(DeviceMessage::json(b"2".to_vec()))
            .await
            .expect("second send accepted");
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body_text(), "2");
    }

    #[tokio::test]
    async fn shadow_is_unsupported_without_backing_document() {
        let transport = InMemoryTransport::without_shadow();
        assert!(matches!(
            transport.get_shadow().await,
            Err(MessagingError::Unsupported("shadow"))
        ));
    }

    #[tokio::test]
    async fn shadow_merges_reported_patches() {
        let shadow = InMemoryShadow::new();
        let first = json!({"oad": false, "isSimulator": true});
        let second = json!({"oad": true});
        shadow
            .report_properties(first.as_object().cloned().unwrap_or_default())
            .await
            .expect("report");
        shadow
            .report_properties(second.as_object().cloned().unwrap_or_default())
            .await
            .expect("report");
        let document = serde_json::Value::Object(shadow.reported_document());
        assert_eq!(document, json!({"oad": true, "isSimulator": true}));
        assert_eq!(shadow.reported().len(), 2);
    }

    #[tokio::test]
    async fn unreachable_provider_fails_to_connect() {
        let provider = LoopbackProvider::unreachable("iv-pump-01");
        assert!(matches!(
            provider.connect().await,
            Err(MessagingError::Provisioning(_))
        ));
        assert_eq!(provider.device_id(), "iv-pump-01");
    }
}
