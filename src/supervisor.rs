//! The launch supervisor: a single forward pass through
//! backend -> frontend -> content load, then steady-state event relay until
//! exit.
//!
//! Almost nothing here is fatal. Every phase outcome lets the sequence
//! advance; the content layer shows its own offline state when the backend
//! never came up.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::{ShellConfig, LOOPBACK};
use crate::error::LaunchError;
use crate::events::{self, EventBus, EventReceiver, ShellEvent, SHELL_SOURCE};
use crate::launcher::{LaunchOutcome, ServiceLauncher, ServiceSpec, Started};
use crate::probe::{self, ReadinessCheck};
use crate::process::{ExitRecord, ProcessHandle};
use crate::resolver::Platform;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::surface::{Surface, SurfaceController, SurfaceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    BackendStarting,
    BackendAwaited,
    FrontendStarting,
    FrontendAwaited,
    ContentLoading,
    Running,
    ShuttingDown,
    Stopped,
}

/// Everything one launch needs, resolved up front.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub backend: ServiceSpec,
    pub backend_check: ReadinessCheck,
    pub backend_timeout: Duration,
    pub frontend: ServiceSpec,
    pub frontend_host: String,
    pub frontend_port: u16,
    pub frontend_check: ReadinessCheck,
    pub frontend_timeout: Duration,
    pub content_url: String,
    pub poll_interval: Duration,
    pub load_retry_delay: Duration,
    pub terminate_grace: Duration,
    pub dev_mode: bool,
}

impl LaunchPlan {
    pub fn from_config(config: &ShellConfig, platform: Platform) -> Self {
        Self {
            backend: config.backend_spec(platform),
            backend_check: config.backend_check(),
            backend_timeout: config.backend_timeout,
            frontend: config.frontend_spec(platform),
            frontend_host: LOOPBACK.to_string(),
            frontend_port: config.frontend_port,
            frontend_check: config.frontend_check(),
            frontend_timeout: config.frontend_timeout,
            content_url: config.content_url(),
            poll_interval: config.poll_interval,
            load_retry_delay: config.load_retry_delay,
            terminate_grace: config.terminate_grace,
            dev_mode: config.dev_mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchReport {
    pub backend: LaunchOutcome,
    pub frontend: LaunchOutcome,
    pub frontend_ready: bool,
    pub content_load_accepted: bool,
    pub content_load_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub spawned_at: DateTime<Utc>,
    pub exit: Option<ExitRecord>,
}

/// Snapshot published on every phase change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellStatus {
    pub phase: Phase,
    pub surface: SurfaceState,
    pub report: Option<LaunchReport>,
    pub services: Vec<ServiceStatus>,
}

/// Event side of the supervisor: the receiver and the surface it drives.
struct Relay<S> {
    events: EventReceiver,
    surface: SurfaceController<S>,
}

impl<S: Surface> Relay<S> {
    fn dispatch(&mut self, event: ShellEvent) {
        events::relay(&event);
        if let ShellEvent::Surface(surface_event) = &event {
            self.surface.handle(surface_event);
        }
    }

    /// Drives `fut` to completion while relaying events as they arrive.
    async fn pump_during<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                Some(event) = self.events.recv() => self.dispatch(event),
            }
        }
    }

    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.dispatch(event);
        }
    }
}

pub struct Supervisor<S> {
    plan: LaunchPlan,
    launcher: ServiceLauncher,
    relay: Relay<S>,
    handles: Vec<ProcessHandle>,
    spawned: HashSet<String>,
    phase: Phase,
    report: Option<LaunchReport>,
    status: watch::Sender<ShellStatus>,
}

impl<S: Surface> Supervisor<S> {
    /// `surface` must already exist in its hidden state. `bus` and `events`
    /// are the two ends of the shell event channel.
    pub fn new(plan: LaunchPlan, surface: S, bus: EventBus, events: EventReceiver) -> Self {
        let (status, _) = watch::channel(ShellStatus {
            phase: Phase::Init,
            surface: SurfaceState::Hidden,
            report: None,
            services: Vec::new(),
        });
        Self {
            launcher: ServiceLauncher::new(bus.clone(), plan.poll_interval),
            relay: Relay {
                events,
                surface: SurfaceController::new(surface, bus),
            },
            plan,
            handles: Vec::new(),
            spawned: HashSet::new(),
            phase: Phase::Init,
            report: None,
            status,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn report(&self) -> Option<&LaunchReport> {
        self.report.as_ref()
    }

    pub fn surface(&self) -> &SurfaceController<S> {
        &self.relay.surface
    }

    pub fn handles(&self) -> &[ProcessHandle] {
        &self.handles
    }

    pub fn handle(&self, name: &str) -> Option<&ProcessHandle> {
        self.handles.iter().find(|h| h.name() == name)
    }

    pub fn subscribe(&self) -> watch::Receiver<ShellStatus> {
        self.status.subscribe()
    }

    /// Runs the startup sequence. Never aborts early; the report records
    /// what each phase ended with.
    pub async fn start(&mut self) -> LaunchReport {
        self.enter(Phase::BackendStarting);
        let backend_spec = self.plan.backend.clone();
        let backend = match self.adopt_spawn(&backend_spec) {
            Ok(()) => {
                self.enter(Phase::BackendAwaited);
                let name = self.plan.backend.name.clone();
                let outcome = self
                    .relay
                    .pump_during(self.launcher.await_healthy(
                        &name,
                        &self.plan.backend_check,
                        self.plan.backend_timeout,
                    ))
                    .await;
                match outcome {
                    LaunchOutcome::Healthy => {
                        log::info!(target: SHELL_SOURCE, "backend is healthy")
                    }
                    _ => log::warn!(
                        target: SHELL_SOURCE,
                        "backend did not report healthy within {}ms (continuing anyway)",
                        self.plan.backend_timeout.as_millis()
                    ),
                }
                outcome
            }
            Err(err) => {
                log::error!(
                    target: SHELL_SOURCE,
                    "backend failed to start: {err} (continuing anyway)"
                );
                LaunchOutcome::SpawnFailed(err.to_string())
            }
        };

        self.enter(Phase::FrontendStarting);
        let frontend_start = self.start_frontend().await;

        self.enter(Phase::FrontendAwaited);
        let frontend_ready = self
            .relay
            .pump_during(probe::wait_for(
                self.launcher.client(),
                &self.plan.frontend_check,
                self.plan.frontend_timeout,
                self.launcher.interval(),
            ))
            .await;
        if frontend_ready {
            log::info!(
                target: SHELL_SOURCE,
                "frontend is ready at {}",
                self.plan.frontend_check.target()
            );
        } else {
            log::warn!(
                target: SHELL_SOURCE,
                "frontend never became ready at {}",
                self.plan.frontend_check.target()
            );
        }
        let frontend = frontend_start.unwrap_or(if frontend_ready {
            LaunchOutcome::Healthy
        } else {
            LaunchOutcome::TimedOutDegraded
        });

        self.enter(Phase::ContentLoading);
        let (content_load_accepted, content_load_attempts) = self.load_content().await;

        let report = LaunchReport {
            backend,
            frontend,
            frontend_ready,
            content_load_accepted,
            content_load_attempts,
        };
        self.report = Some(report.clone());
        self.enter(Phase::Running);

        if self.plan.dev_mode {
            self.relay.surface.open_devtools();
        }
        report
    }

    /// Steady state: relays events for the rest of the application's life.
    pub async fn pump(&mut self) {
        while let Some(event) = self.relay.events.recv().await {
            let exited = matches!(event, ShellEvent::Exited { .. });
            self.relay.dispatch(event);
            if exited {
                self.publish();
            }
        }
    }

    /// Relays whatever is queued right now without waiting.
    pub fn drain(&mut self) {
        self.relay.drain();
    }

    /// Tree-kills every owned process and closes the surface. Safe to call
    /// at any phase.
    pub fn shutdown(&mut self) -> ShutdownReport {
        self.enter(Phase::ShuttingDown);
        self.relay.surface.mark_closed();
        let report = ShutdownCoordinator::new(self.plan.terminate_grace).run(self.handles.drain(..));
        self.enter(Phase::Stopped);
        report
    }

    /// Full lifecycle: start, relay events, and shut down once `exit`
    /// resolves. An exit during startup still terminates whatever was
    /// spawned so far.
    pub async fn run_until<F>(mut self, exit: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = async {
                self.start().await;
                self.pump().await;
            } => {}
            _ = exit => log::info!(target: SHELL_SOURCE, "exit requested"),
        }
        self.drain();
        self.shutdown()
    }

    async fn start_frontend(&mut self) -> Option<LaunchOutcome> {
        let spec = self.plan.frontend.clone();
        if let Err(err) = self.check_unspawned(&spec.name) {
            log::error!(target: SHELL_SOURCE, "{err}");
            return Some(LaunchOutcome::SpawnFailed(err.to_string()));
        }
        let started = self
            .launcher
            .start_if_port_free(&spec, &self.plan.frontend_host, self.plan.frontend_port)
            .await;
        match started {
            Ok(Started::Spawned(handle)) => {
                self.adopt(handle);
                None
            }
            Ok(Started::AlreadyServing) => Some(LaunchOutcome::PortAlreadyOccupied),
            Err(err) => {
                log::error!(
                    target: SHELL_SOURCE,
                    "frontend failed to start: {err} (continuing anyway)"
                );
                Some(LaunchOutcome::SpawnFailed(err.to_string()))
            }
        }
    }

    async fn load_content(&mut self) -> (bool, u32) {
        let url = self.plan.content_url.clone();
        match self.relay.surface.load(&url) {
            Ok(()) => return (true, 1),
            Err(err) => log::warn!(target: SHELL_SOURCE, "content load error: {err}"),
        }

        self.relay
            .pump_during(tokio::time::sleep(self.plan.load_retry_delay))
            .await;
        match self.relay.surface.load(&url) {
            Ok(()) => (true, 2),
            Err(err) => {
                log::warn!(
                    target: SHELL_SOURCE,
                    "content load retry failed: {err}; leaving surface for manual reload"
                );
                (false, 2)
            }
        }
    }

    fn check_unspawned(&self, name: &str) -> Result<(), LaunchError> {
        if self.spawned.contains(name) {
            return Err(LaunchError::AlreadyRunning(name.to_string()));
        }
        Ok(())
    }

    fn adopt_spawn(&mut self, spec: &ServiceSpec) -> Result<(), LaunchError> {
        self.check_unspawned(&spec.name)?;
        let handle = self.launcher.start(spec)?;
        self.adopt(handle);
        Ok(())
    }

    fn adopt(&mut self, handle: ProcessHandle) {
        self.spawned.insert(handle.name().to_string());
        self.handles.push(handle);
        self.publish();
    }

    fn enter(&mut self, phase: Phase) {
        log::info!(target: SHELL_SOURCE, "phase={phase:?}");
        self.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        let snapshot = ShellStatus {
            phase: self.phase,
            surface: self.relay.surface.state(),
            report: self.report.clone(),
            services: self
                .handles
                .iter()
                .map(|h| ServiceStatus {
                    name: h.name().to_string(),
                    pid: h.pid(),
                    spawned_at: h.spawned_at(),
                    exit: h.exit_record(),
                })
                .collect(),
        };
        self.status.send_replace(snapshot);
    }
}
