//! ---
//! ivsim_section: "11-simulation"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Event loop driving ticks, lifecycle and shadow sync."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::future::{self, Future};
use std::sync::Arc;

use ivsim_common::SimulationConfig;
use ivsim_msg::{
    CloudMessage, ConnectionProvider, DeviceMessage, MessagingError, PropertyPatch, ShadowHandle,
    TransportEvent, TransportHandle,
};
use ivsim_rt::{RateLimiter, TimerSet, TimerToken};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::SimError;
use crate::lifecycle::{Lifecycle, LifecycleStep, PhaseTimingPlan};
use crate::shadow::{DeviceProperties, ShadowSynchronizer};
use crate::telemetry::{OperatingPhase, TelemetryModel, TelemetrySnapshot};

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The lifecycle reached its terminal step.
    Completed,
    /// The caller's shutdown future resolved first.
    Shutdown,
}

/// State at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub ticks: u64,
    pub phases: Vec<OperatingPhase>,
    pub snapshot: TelemetrySnapshot,
    pub properties: DeviceProperties,
}

enum EngineSignal {
    Shadow(Result<Arc<dyn ShadowHandle>, MessagingError>),
    Reopened(Result<(), MessagingError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineTimer {
    Lifecycle(LifecycleStep),
    Reopen,
}

/// Simulated infusion device bound to one connection provider.
pub struct SimulationEngine {
    config: SimulationConfig,
    provider: Arc<dyn ConnectionProvider>,
    model: TelemetryModel,
    properties: DeviceProperties,
}

impl SimulationEngine {
    pub fn new(
        config: SimulationConfig,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Result<Self, SimError> {
        config.validate()?;
        let model = TelemetryModel::from_config(&config);
        Ok(Self {
            config,
            provider,
            model,
            properties: DeviceProperties::default(),
        })
    }

    /// Replace the initial telemetry state.
    pub fn with_model(mut self, model: TelemetryModel) -> Self {
        self.model = model;
        self
    }

    pub fn model(&self) -> &TelemetryModel {
        &self.model
    }

    /// Run until the lifecycle terminates.
    pub async fn run(self) -> Result<RunSummary, SimError> {
        self.run_until(future::pending()).await
    }

    /// Run until the lifecycle terminates or `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<RunSummary, SimError>
    where
        F: Future<Output = ()>,
    {
        let span = info_span!("engine", device_id = %self.provider.device_id());
        self.drive(shutdown).instrument(span).await
    }

    async fn drive<F>(self, shutdown: F) -> Result<RunSummary, SimError>
    where
        F: Future<Output = ()>,
    {
        let transport = match self.provider.connect().await {
            Ok(transport) => transport,
            Err(source) => {
                error!(error = %source, "could not obtain a transport, giving up");
                return Err(SimError::Startup {
                    device_id: self.provider.device_id().to_owned(),
                    source,
                });
            }
        };

        let mut events = transport.subscribe();
        let mut events_open = true;
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let mut session = Session {
            transport: transport.clone(),
            config: self.config,
            model: self.model,
            lifecycle: Lifecycle::new(),
            shadow: ShadowSynchronizer::new(self.properties),
            shadow_pending: false,
            desired: None,
            ticker: None,
            timers: TimerSet::new(),
            lifecycle_timers: Vec::new(),
            lifecycle_armed: false,
            reopen_pending: false,
            reopen_retry: None,
            signal_tx,
            signals,
        };

        info!(transport = transport.name(), "opening session");
        if let Err(err) = transport.open().await {
            warn!(error = %err, "opening session failed");
        }

        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break RunOutcome::Shutdown;
                }
                timer = session.timers.expired() => {
                    if session.on_timer(timer) {
                        break RunOutcome::Completed;
                    }
                }
                event = events.recv(), if events_open => match event {
                    Ok(event) => session.on_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transport events dropped");
                    }
                    Err(RecvError::Closed) => {
                        warn!("transport event stream closed");
                        events_open = false;
                    }
                },
                Some(signal) = session.signals.recv() => session.on_signal(signal),
                patch = next_desired(&mut session.desired) => session.on_desired(patch),
                _ = next_tick(&mut session.ticker) => session.tick(),
            }
        };

        session.ticker = None;
        session.timers.cancel_all();
        let summary = RunSummary {
            outcome,
            ticks: session.model.snapshot().message_tracking_id,
            phases: session.lifecycle.history().to_vec(),
            snapshot: session.model.snapshot().clone(),
            properties: session.shadow.properties(),
        };
        info!(outcome = ?summary.outcome, ticks = summary.ticks, "simulation stopped");
        Ok(summary)
    }
}

/// Mutable run state, touched only from the event loop.
struct Session {
    transport: Arc<dyn TransportHandle>,
    config: SimulationConfig,
    model: TelemetryModel,
    lifecycle: Lifecycle,
    shadow: ShadowSynchronizer,
    shadow_pending: bool,
    desired: Option<broadcast::Receiver<PropertyPatch>>,
    ticker: Option<RateLimiter>,
    timers: TimerSet<EngineTimer>,
    lifecycle_timers: Vec<TimerToken>,
    lifecycle_armed: bool,
    reopen_pending: bool,
    reopen_retry: Option<TimerToken>,
    signal_tx: mpsc::UnboundedSender<EngineSignal>,
    signals: mpsc::UnboundedReceiver<EngineSignal>,
}

impl Session {
    fn on_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connect(),
            TransportEvent::Disconnected => self.on_disconnect(),
            TransportEvent::Message(message) => self.on_message(message),
            TransportEvent::Error(err) => warn!(error = %err, "transport error"),
        }
    }

    fn on_connect(&mut self) {
        info!("transport connected");
        if let Some(retry) = self.reopen_retry.take() {
            self.timers.cancel(retry);
        }
        if self.ticker.is_none() {
            self.ticker = Some(RateLimiter::new(self.config.tick_interval));
            debug!(interval_secs = self.config.tick_interval.as_secs(), "tick timer started");
        } else {
            debug!("tick timer already running");
        }

        if !self.lifecycle_armed {
            self.arm_lifecycle();
        } else if self.config.rearm_lifecycle_on_reconnect {
            self.disarm_lifecycle();
            self.arm_lifecycle();
        }

        self.request_shadow();
    }

    fn on_disconnect(&mut self) {
        if self.ticker.take().is_some() {
            info!("transport disconnected, tick timer stopped");
        } else {
            info!("transport disconnected");
        }
        self.reopen();
    }

    /// Reopen the session; a failure schedules another attempt one tick later.
    fn reopen(&mut self) {
        if self.reopen_pending || self.reopen_retry.is_some() {
            debug!("reopen already in progress");
            return;
        }
        self.reopen_pending = true;
        let transport = self.transport.clone();
        let signals = self.signal_tx.clone();
        spawn_detached(async move {
            let result = transport.open().await;
            let _ = signals.send(EngineSignal::Reopened(result));
        });
    }

    fn on_message(&mut self, message: CloudMessage) {
        info!(
            lock_token = %message.lock_token,
            body = %message.body_text(),
            "cloud message received"
        );
        let transport = self.transport.clone();
        spawn_detached(async move {
            match transport.complete(&message).await {
                Ok(()) => debug!(lock_token = %message.lock_token, "cloud message completed"),
                Err(err) => warn!(error = %err, "completing cloud message failed"),
            }
        });
    }

    fn arm_lifecycle(&mut self) {
        let plan = PhaseTimingPlan::new(
            self.config.idle_duration,
            self.config.charging_duration,
            self.config.tick_interval,
            self.model.snapshot().time_left_of_treatment,
        );
        if plan.active_secs < 0 {
            warn!(
                active_secs = plan.active_secs,
                "treatment shorter than the charging window, charging starts with the active phase"
            );
        }
        for (delay, step) in plan.schedule() {
            let token = self.timers.after(delay, EngineTimer::Lifecycle(step));
            self.lifecycle_timers.push(token);
        }
        self.lifecycle_armed = true;
        info!(
            idle_secs = plan.idle_secs,
            active_secs = plan.active_secs,
            charging_secs = plan.charging_secs,
            "lifecycle armed"
        );
    }

    fn disarm_lifecycle(&mut self) {
        for token in self.lifecycle_timers.drain(..) {
            self.timers.cancel(token);
        }
    }

    /// Returns true once the run should stop.
    fn on_timer(&mut self, timer: EngineTimer) -> bool {
        match timer {
            EngineTimer::Lifecycle(step) => self.on_lifecycle_step(step),
            EngineTimer::Reopen => {
                self.reopen_retry = None;
                self.reopen();
                false
            }
        }
    }

    fn on_lifecycle_step(&mut self, step: LifecycleStep) -> bool {
        match step {
            LifecycleStep::Enter(phase) => {
                match self.lifecycle.advance(phase) {
                    Ok(previous) => {
                        self.model.set_phase(phase);
                        info!(from = %previous, to = %phase, "phase transition");
                    }
                    Err(err) => warn!(error = %err, "phase transition rejected"),
                }
                false
            }
            LifecycleStep::Terminate => match self.lifecycle.terminate() {
                Ok(()) => {
                    self.ticker = None;
                    self.timers.cancel_all();
                    info!("treatment finished");
                    true
                }
                Err(err) => {
                    warn!(error = %err, "termination rejected");
                    false
                }
            },
        }
    }

    fn request_shadow(&mut self) {
        if self.shadow.is_attached() || self.shadow_pending {
            return;
        }
        self.shadow_pending = true;
        let transport = self.transport.clone();
        let signals = self.signal_tx.clone();
        spawn_detached(async move {
            let result = transport.get_shadow().await;
            let _ = signals.send(EngineSignal::Shadow(result));
        });
    }

    fn on_signal(&mut self, signal: EngineSignal) {
        match signal {
            EngineSignal::Shadow(Ok(shadow)) => {
                self.shadow_pending = false;
                self.desired = Some(self.shadow.attach(shadow));
            }
            EngineSignal::Shadow(Err(err)) => {
                self.shadow_pending = false;
                warn!(error = %err, "shadow unavailable, continuing without property sync");
            }
            EngineSignal::Reopened(Ok(())) => {
                self.reopen_pending = false;
                debug!("session reopened");
            }
            EngineSignal::Reopened(Err(err)) => {
                self.reopen_pending = false;
                let delay = self.config.tick_interval;
                warn!(error = %err, retry_in_secs = delay.as_secs(), "reopening session failed");
                if self.reopen_retry.is_none() && !self.lifecycle.is_terminated() {
                    self.reopen_retry = Some(self.timers.after(delay, EngineTimer::Reopen));
                }
            }
        }
    }

    fn on_desired(&mut self, patch: Result<PropertyPatch, RecvError>) {
        match patch {
            Ok(patch) => self.shadow.on_desired_properties_delta(&patch),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "desired property updates dropped"),
            Err(RecvError::Closed) => {
                warn!("desired property stream closed");
                self.desired = None;
            }
        }
    }

    fn tick(&mut self) {
        let snapshot = self.model.advance_one_tick(self.config.tick_interval).clone();
        let body = match self.model.serialize() {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "telemetry serialization failed");
                return;
            }
        };
        let tick = snapshot.message_tracking_id;
        info!(
            tick,
            phase = %snapshot.system_state,
            battery = snapshot.battery_level,
            time_left = snapshot.time_left_of_treatment,
            liquid = snapshot.liquid_left_in_bag,
            "sending telemetry"
        );
        let transport = self.transport.clone();
        let message = DeviceMessage::json(body);
        spawn_detached(async move {
            match transport.send_event(message).await {
                Ok(()) => debug!(tick, "telemetry delivered"),
                Err(err) => warn!(tick, error = %err, "telemetry send failed"),
            }
        });
    }
}

fn spawn_detached<F>(task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(task.in_current_span());
}

async fn next_tick(ticker: &mut Option<RateLimiter>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

async fn next_desired(
    desired: &mut Option<broadcast::Receiver<PropertyPatch>>,
) -> Result<PropertyPatch, RecvError> {
    match desired {
        Some(receiver) => receiver.recv().await,
        None => future::pending().await,
    }
}
