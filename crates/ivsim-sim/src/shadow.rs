//! ---
//! ivsim_section: "11-simulation"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Desired/reported property reconciliation."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::sync::Arc;

use ivsim_msg::{PropertyPatch, ShadowHandle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn, Instrument};

/// Locally owned flags mirrored into the reported section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProperties {
    pub oad: bool,
    pub is_simulator: bool,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            oad: false,
            is_simulator: true,
        }
    }
}

impl DeviceProperties {
    pub fn to_patch(&self) -> PropertyPatch {
        let mut patch = PropertyPatch::new();
        patch.insert("oad".to_owned(), Value::Bool(self.oad));
        patch.insert("isSimulator".to_owned(), Value::Bool(self.is_simulator));
        patch
    }
}

/// Typed view of a desired-property patch restricted to known flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyDelta {
    pub oad: Option<bool>,
    pub is_simulator: Option<bool>,
    /// Keys that were present but not applied.
    pub ignored: Vec<String>,
}

impl PropertyDelta {
    pub fn parse(patch: &PropertyPatch) -> Self {
        let mut delta = Self::default();
        for (key, value) in patch {
            match (key.as_str(), value) {
                ("oad", Value::Bool(flag)) => delta.oad = Some(*flag),
                ("isSimulator", Value::Bool(flag)) => delta.is_simulator = Some(*flag),
                ("$version", _) => {}
                _ => delta.ignored.push(key.clone()),
            }
        }
        delta
    }

    /// Apply onto `properties`; returns whether anything changed.
    pub fn apply(&self, properties: &mut DeviceProperties) -> bool {
        let before = *properties;
        if let Some(oad) = self.oad {
            properties.oad = oad;
        }
        if let Some(is_simulator) = self.is_simulator {
            properties.is_simulator = is_simulator;
        }
        before != *properties
    }
}

/// Holds the device flags and the queue reporting them to the shadow.
///
/// Reports are sent one at a time in the order they were issued, so the
/// service always ends up with the latest property set.
#[derive(Default)]
pub struct ShadowSynchronizer {
    properties: DeviceProperties,
    reports: Option<mpsc::UnboundedSender<PropertyPatch>>,
}

impl ShadowSynchronizer {
    pub fn new(properties: DeviceProperties) -> Self {
        Self {
            properties,
            reports: None,
        }
    }

    pub fn properties(&self) -> DeviceProperties {
        self.properties
    }

    pub fn is_attached(&self) -> bool {
        self.reports.is_some()
    }

    /// Start using `shadow`: apply the desired section it was fetched with,
    /// report the full property set once and hand back the desired-change
    /// subscription.
    pub fn attach(&mut self, shadow: Arc<dyn ShadowHandle>) -> broadcast::Receiver<PropertyPatch> {
        let desired = shadow.desired_changes();
        if let Some(initial) = shadow.initial_desired() {
            PropertyDelta::parse(&initial).apply(&mut self.properties);
        }
        self.reports = Some(spawn_reporter(shadow));
        info!(properties = ?self.properties, "shadow obtained");
        self.report();
        desired
    }

    pub fn on_desired_properties_delta(&mut self, patch: &PropertyPatch) {
        let delta = PropertyDelta::parse(patch);
        if !delta.ignored.is_empty() {
            debug!(keys = ?delta.ignored, "ignoring unrecognised desired properties");
        }
        let changed = delta.apply(&mut self.properties);
        info!(changed, properties = ?self.properties, "desired properties applied");
        self.report();
    }

    /// Queue the full property set; the acknowledgement is only logged.
    pub fn report(&self) {
        let Some(reports) = &self.reports else {
            debug!("no shadow attached, skipping report");
            return;
        };
        if reports.send(self.properties.to_patch()).is_err() {
            warn!("shadow reporter stopped, dropping report");
        }
    }
}

fn spawn_reporter(shadow: Arc<dyn ShadowHandle>) -> mpsc::UnboundedSender<PropertyPatch> {
    let (reports, mut queue) = mpsc::unbounded_channel::<PropertyPatch>();
    let task = async move {
        while let Some(patch) = queue.recv().await {
            match shadow.report_properties(patch).await {
                Ok(()) => debug!("reported properties acknowledged"),
                Err(err) => warn!(error = %err, "reporting properties failed"),
            }
        }
    };
    tokio::spawn(task.in_current_span());
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use ivsim_msg::InMemoryShadow;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Shadow whose acknowledgement time depends on the reported `oad` flag.
    struct UnevenShadow {
        desired: broadcast::Sender<PropertyPatch>,
        initial: Option<PropertyPatch>,
        landed: Mutex<Vec<PropertyPatch>>,
    }

    impl UnevenShadow {
        fn new(initial: Option<PropertyPatch>) -> Self {
            let (desired, _) = broadcast::channel(4);
            Self {
                desired,
                initial,
                landed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ShadowHandle for UnevenShadow {
        fn desired_changes(&self) -> broadcast::Receiver<PropertyPatch> {
            self.desired.subscribe()
        }

        async fn report_properties(&self, patch: PropertyPatch) -> ivsim_msg::Result<()> {
            let slow = patch.get("oad") == Some(&Value::Bool(false));
            let delay = if slow { 500 } else { 10 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.landed.lock().push(patch);
            Ok(())
        }

        fn initial_desired(&self) -> Option<PropertyPatch> {
            self.initial.clone()
        }
    }

    fn patch(value: Value) -> PropertyPatch {
        value.as_object().cloned().unwrap_or_default()
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn delta_keeps_only_boolean_known_keys() {
        let delta = PropertyDelta::parse(&patch(json!({
            "oad": true,
            "isSimulator": "yes",
            "brightness": 3,
            "$version": 4
        })));
        assert_eq!(delta.oad, Some(true));
        assert_eq!(delta.is_simulator, None);
        let mut ignored = delta.ignored.clone();
        ignored.sort();
        assert_eq!(ignored, vec!["brightness".to_owned(), "isSimulator".to_owned()]);
    }

    #[test]
    fn applying_delta_touches_only_named_flags() {
        let mut properties = DeviceProperties::default();
        let changed = PropertyDelta::parse(&patch(json!({"oad": true}))).apply(&mut properties);
        assert!(changed);
        assert_eq!(
            properties,
            DeviceProperties {
                oad: true,
                is_simulator: true
            }
        );
        assert!(!PropertyDelta::parse(&patch(json!({"oad": true}))).apply(&mut properties));
    }

    #[test]
    fn reported_patch_uses_wire_names() {
        let value = Value::Object(DeviceProperties::default().to_patch());
        assert_eq!(value, json!({"oad": false, "isSimulator": true}));
    }

    #[tokio::test]
    async fn attach_reports_once_and_each_delta_reports_full_set() {
        let shadow = InMemoryShadow::new();
        let mut sync = ShadowSynchronizer::default();
        let _desired = sync.attach(Arc::new(shadow.clone()));
        settle().await;
        assert_eq!(shadow.reported().len(), 1);

        sync.on_desired_properties_delta(&patch(json!({"oad": true})));
        settle().await;
        let reported = shadow.reported();
        assert_eq!(reported.len(), 2);
        assert_eq!(Value::Object(reported[1].clone()), json!({"oad": true, "isSimulator": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_land_in_issue_order() {
        let shadow = Arc::new(UnevenShadow::new(None));
        let mut sync = ShadowSynchronizer::default();
        let _desired = sync.attach(shadow.clone());
        sync.on_desired_properties_delta(&patch(json!({"oad": true})));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let landed: Vec<Value> = shadow.landed.lock().iter().cloned().map(Value::Object).collect();
        assert_eq!(
            landed,
            vec![
                json!({"oad": false, "isSimulator": true}),
                json!({"oad": true, "isSimulator": true}),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn attach_applies_initial_desired_before_first_report() {
        let initial = patch(json!({"oad": true, "isSimulator": false, "$version": 7}));
        let shadow = Arc::new(UnevenShadow::new(Some(initial)));
        let mut sync = ShadowSynchronizer::default();
        let _desired = sync.attach(shadow.clone());
        assert_eq!(
            sync.properties(),
            DeviceProperties {
                oad: true,
                is_simulator: false
            }
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        let landed = shadow.landed.lock().clone();
        assert_eq!(landed.len(), 1);
        assert_eq!(
            Value::Object(landed[0].clone()),
            json!({"oad": true, "isSimulator": false})
        );
    }

    #[tokio::test]
    async fn report_failures_are_not_retried() {
        let shadow = InMemoryShadow::new();
        shadow.fail_next_reports(1);
        let mut sync = ShadowSynchronizer::default();
        let _desired = sync.attach(Arc::new(shadow.clone()));
        settle().await;
        assert!(shadow.reported().is_empty());

        sync.on_desired_properties_delta(&patch(json!({"isSimulator": false})));
        settle().await;
        assert_eq!(
            Value::Object(shadow.reported_document()),
            json!({"oad": false, "isSimulator": false})
        );
    }
}
