//! ---
//! ivsim_section: "11-simulation"
//! ivsim_subsection: "tests"
//! ivsim_type: "test"
//! ivsim_scope: "code"
//! ivsim_description: "Engine behaviour over the loopback transport with paused time."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ivsim_common::SimulationConfig;
use ivsim_msg::{CloudMessage, InMemoryTransport, LoopbackProvider, PropertyPatch, TransportEvent};
use ivsim_sim::{
    BatteryTuning, DeviceProperties, OperatingPhase, RunOutcome, RunSummary, SimError,
    SimulationEngine, TelemetryModel, TelemetryPayload,
};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const DEVICE_ID: &str = "iv-pump-01";

/// 20 mL at 360 mL/h: 200 s of treatment, 78 s active. Phases land at 30 s,
/// 108 s and 228 s; the run ends at 230 s.
fn config() -> SimulationConfig {
    SimulationConfig {
        tick_interval: Duration::from_secs(2),
        bag_size_ml: 20.0,
        flowrate_ml_per_hour: 360.0,
        idle_duration: Duration::from_secs(30),
        charging_duration: Duration::from_secs(120),
        random_seed: Some(1),
        ..SimulationConfig::default()
    }
}

fn engine(config: SimulationConfig, transport: &InMemoryTransport) -> Result<SimulationEngine> {
    let model = TelemetryModel::new(
        80.0,
        config.bag_size_ml,
        config.flowrate_ml_per_hour,
        BatteryTuning::default(),
    );
    let provider = Arc::new(LoopbackProvider::new(DEVICE_ID, transport.clone()));
    Ok(SimulationEngine::new(config, provider)?.with_model(model))
}

struct Running {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<RunSummary, SimError>>,
}

fn start(engine: SimulationEngine) -> Running {
    let (stop, stopped) = oneshot::channel();
    let handle = tokio::spawn(engine.run_until(async move {
        let _ = stopped.await;
    }));
    Running { stop, handle }
}

impl Running {
    async fn finish(self) -> RunSummary {
        self.handle
            .await
            .expect("engine task")
            .expect("run succeeds")
    }

    async fn shutdown(self) -> RunSummary {
        let Running { stop, handle } = self;
        let _ = stop.send(());
        handle
            .await
            .expect("engine task")
            .expect("run succeeds")
    }
}

async fn at(start: Instant, millis: u64) {
    tokio::time::sleep_until(start + Duration::from_millis(millis)).await;
}

fn payloads(transport: &InMemoryTransport) -> Vec<TelemetryPayload> {
    transport
        .sent()
        .iter()
        .map(|message| serde_json::from_slice(&message.body).expect("telemetry json"))
        .collect()
}

fn patch(value: serde_json::Value) -> PropertyPatch {
    value.as_object().cloned().unwrap_or_default()
}

fn phase_runs(payloads: &[TelemetryPayload]) -> Vec<(OperatingPhase, usize)> {
    let mut runs: Vec<(OperatingPhase, usize)> = Vec::new();
    for payload in payloads {
        match runs.last_mut() {
            Some((phase, count)) if *phase == payload.system_state => *count += 1,
            _ => runs.push((payload.system_state, 1)),
        }
    }
    runs
}

const ALL_PHASES: [OperatingPhase; 4] = [
    OperatingPhase::Idle,
    OperatingPhase::Active,
    OperatingPhase::Charging,
    OperatingPhase::Finished,
];

#[tokio::test(start_paused = true)]
async fn full_run_walks_every_phase_once_and_stops_one_tick_after_finished() -> Result<()> {
    let transport = InMemoryTransport::new();
    let started = Instant::now();
    let summary = engine(config(), &transport)?.run().await?;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(started.elapsed(), Duration::from_secs(230));
    assert_eq!(summary.phases, ALL_PHASES.to_vec());
    assert_eq!(summary.ticks, 114);

    let payloads = payloads(&transport);
    assert_eq!(payloads.len(), 114);
    assert_eq!(
        phase_runs(&payloads),
        vec![
            (OperatingPhase::Idle, 14),
            (OperatingPhase::Active, 39),
            (OperatingPhase::Charging, 60),
            (OperatingPhase::Finished, 1),
        ]
    );
    for (index, payload) in payloads.iter().enumerate() {
        assert_eq!(payload.time_left_of_treatment, 200 - 2 * (index as i64 + 1));
        assert_eq!(payload.flowrate, 360.0);
    }
    for pair in payloads.windows(2) {
        if pair[1].system_state == OperatingPhase::Charging {
            assert!(pair[1].battery_level >= pair[0].battery_level);
        } else {
            assert!(pair[1].battery_level <= pair[0].battery_level);
        }
    }

    let expected_battery = 80.0 - 0.02 * 54.0 + 0.25 * 60.0;
    assert!((summary.snapshot.battery_level - expected_battery).abs() < 1e-9);
    assert!((summary.snapshot.liquid_left_in_bag - (-2.8)).abs() < 1e-9);
    assert_eq!(summary.snapshot.time_left_of_treatment, -28);
    assert_eq!(summary.snapshot.system_state, OperatingPhase::Finished);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn telemetry_carries_content_metadata() -> Result<()> {
    let transport = InMemoryTransport::new();
    let running = start(engine(config(), &transport)?);
    at(Instant::now(), 2_500).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content_type, "application/json");
    assert_eq!(sent[0].content_encoding, "utf-8");
    assert!(sent[0].properties.contains_key("iothub-creation-time-utc"));
    assert_eq!(
        sent[0].body_text(),
        r#"{"batteryLevel":80,"systemState":"idle","timeLeftOfTreatment":198,"liquidLeftInBag":20,"flowrate":360.0}"#
    );
    running.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_send_does_not_stop_the_tick() -> Result<()> {
    let transport = InMemoryTransport::new();
    transport.fail_next_sends(1);
    let started = Instant::now();
    let running = start(engine(config(), &transport)?);

    at(started, 4_500).await;
    let payloads = payloads(&transport);
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].time_left_of_treatment, 196);

    let summary = running.shutdown().await;
    assert_eq!(summary.outcome, RunOutcome::Shutdown);
    assert_eq!(summary.ticks, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn desired_delta_updates_only_named_flag_and_reports_once() -> Result<()> {
    let transport = InMemoryTransport::new();
    let shadow = transport.shadow().expect("loopback shadow");
    let started = Instant::now();
    let running = start(engine(config(), &transport)?);

    at(started, 1_000).await;
    let reported = shadow.reported();
    assert_eq!(reported.len(), 1);
    assert_eq!(
        serde_json::Value::Object(reported[0].clone()),
        json!({"oad": false, "isSimulator": true})
    );

    shadow.push_desired(patch(json!({"oad": true, "$version": 3})));
    at(started, 1_500).await;
    let reported = shadow.reported();
    assert_eq!(reported.len(), 2);
    assert_eq!(
        serde_json::Value::Object(reported[1].clone()),
        json!({"oad": true, "isSimulator": true})
    );

    shadow.push_desired(patch(json!({"volume": 11})));
    at(started, 1_800).await;
    assert_eq!(shadow.reported().len(), 3);

    let summary = running.shutdown().await;
    assert_eq!(
        summary.properties,
        DeviceProperties {
            oad: true,
            is_simulator: true
        }
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cloud_messages_are_completed() -> Result<()> {
    let transport = InMemoryTransport::new();
    let started = Instant::now();
    let running = start(engine(config(), &transport)?);

    at(started, 1_000).await;
    transport.emit(TransportEvent::Message(CloudMessage::new("lock-9", "reboot")));
    transport.emit(TransportEvent::Error("transient".to_owned()));
    at(started, 1_500).await;
    assert_eq!(transport.completed(), vec!["lock-9".to_owned()]);

    running.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn repeated_connect_keeps_a_single_tick_timer() -> Result<()> {
    let transport = InMemoryTransport::new();
    let started = Instant::now();
    let running = start(engine(config(), &transport)?);

    at(started, 3_000).await;
    transport.emit(TransportEvent::Connected);
    at(started, 10_500).await;
    assert_eq!(transport.sent().len(), 5);
    assert_eq!(transport.open_calls(), 1);

    let summary = running.finish().await;
    assert_eq!(started.elapsed(), Duration::from_secs(230));
    assert_eq!(summary.phases, ALL_PHASES.to_vec());
    assert_eq!(summary.ticks, 114);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_telemetry_until_reconnected() -> Result<()> {
    let transport = InMemoryTransport::new();
    let started = Instant::now();
    let running = start(engine(config(), &transport)?);

    // reopen fails at 3 s and 5 s, succeeds at 7 s; ticks resume at 9 s
    at(started, 3_000).await;
    transport.fail_next_opens(2);
    transport.emit(TransportEvent::Disconnected);
    at(started, 6_000).await;
    assert_eq!(transport.sent().len(), 1);
    assert_eq!(transport.open_calls(), 3);

    at(started, 8_000).await;
    assert_eq!(transport.open_calls(), 4);
    assert_eq!(transport.sent().len(), 1);

    at(started, 11_500).await;
    assert_eq!(transport.sent().len(), 3);
    assert_eq!(transport.open_calls(), 4);

    let summary = running.shutdown().await;
    assert_eq!(summary.phases, vec![OperatingPhase::Idle]);
    assert_eq!(summary.ticks, 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn repeated_disconnects_share_one_reopen_attempt() -> Result<()> {
    let transport = InMemoryTransport::new();
    let started = Instant::now();
    let running = start(engine(config(), &transport)?);

    at(started, 3_000).await;
    transport.fail_next_opens(1);
    transport.emit(TransportEvent::Disconnected);
    transport.emit(TransportEvent::Disconnected);
    at(started, 4_000).await;
    assert_eq!(transport.open_calls(), 2);

    at(started, 5_500).await;
    assert_eq!(transport.open_calls(), 3);

    running.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn treatment_too_long_to_schedule_keeps_running() -> Result<()> {
    let transport = InMemoryTransport::new();
    let started = Instant::now();
    let model = TelemetryModel::new(80.0, 840.0, 1e-20, BatteryTuning::default());
    assert_eq!(model.snapshot().time_left_of_treatment, i64::MAX);
    let running = start(engine(config(), &transport)?.with_model(model));

    at(started, 40_500).await;
    let summary = running.shutdown().await;
    assert_eq!(summary.outcome, RunOutcome::Shutdown);
    assert_eq!(summary.phases, vec![OperatingPhase::Idle, OperatingPhase::Active]);
    assert_eq!(summary.ticks, 20);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reconnect_keeps_the_original_lifecycle_schedule() -> Result<()> {
    let transport = InMemoryTransport::new();
    let started = Instant::now();
    let running = start(engine(config(), &transport)?);

    at(started, 11_000).await;
    transport.emit(TransportEvent::Disconnected);

    let summary = running.finish().await;
    assert_eq!(transport.open_calls(), 2);
    assert_eq!(started.elapsed(), Duration::from_secs(230));
    assert_eq!(summary.phases, ALL_PHASES.to_vec());
    assert_eq!(summary.ticks, 114);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rearm_option_restarts_the_schedule_without_duplicating_phases() -> Result<()> {
    let transport = InMemoryTransport::new();
    let started = Instant::now();
    let config = SimulationConfig {
        rearm_lifecycle_on_reconnect: true,
        ..config()
    };
    let running = start(engine(config, &transport)?);

    // five ticks leave 190 s, so the re-armed chain ends 231 s after start
    at(started, 11_000).await;
    transport.emit(TransportEvent::Disconnected);

    let summary = running.finish().await;
    assert_eq!(started.elapsed(), Duration::from_secs(231));
    assert_eq!(summary.phases, ALL_PHASES.to_vec());
    assert_eq!(summary.ticks, 114);
    let last = payloads(&transport).pop().expect("telemetry sent");
    assert_eq!(last.system_state, OperatingPhase::Finished);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn short_treatment_enters_charging_right_after_active() -> Result<()> {
    let transport = InMemoryTransport::new();
    let started = Instant::now();
    let config = SimulationConfig {
        bag_size_ml: 10.0,
        ..config()
    };
    let summary = engine(config, &transport)?.run().await?;

    assert_eq!(started.elapsed(), Duration::from_secs(152));
    assert_eq!(summary.phases, ALL_PHASES.to_vec());
    let runs = phase_runs(&payloads(&transport));
    assert_eq!(runs[0], (OperatingPhase::Idle, 14));
    assert_eq!(runs[1].0, OperatingPhase::Charging);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missing_shadow_does_not_stop_telemetry() -> Result<()> {
    let transport = InMemoryTransport::without_shadow();
    let started = Instant::now();
    let running = start(engine(config(), &transport)?);

    at(started, 4_500).await;
    assert_eq!(transport.sent().len(), 2);

    let summary = running.shutdown().await;
    assert_eq!(summary.properties, DeviceProperties::default());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unreachable_backend_fails_startup_without_scheduling() -> Result<()> {
    let provider = Arc::new(LoopbackProvider::unreachable(DEVICE_ID));
    let started = Instant::now();
    let err = SimulationEngine::new(config(), provider.clone())?
        .run()
        .await
        .expect_err("startup fails");

    assert!(matches!(err, SimError::Startup { ref device_id, .. } if device_id == DEVICE_ID));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(provider.transport().open_calls(), 0);
    Ok(())
}

#[test]
fn invalid_configuration_is_rejected_before_connecting() {
    let transport = InMemoryTransport::new();
    let provider = Arc::new(LoopbackProvider::new(DEVICE_ID, transport.clone()));
    let config = SimulationConfig {
        flowrate_ml_per_hour: 0.0,
        ..config()
    };
    let err = SimulationEngine::new(config, provider)
        .err()
        .expect("config rejected");
    assert!(matches!(err, SimError::Configuration(_)));
    assert_eq!(transport.open_calls(), 0);
}
