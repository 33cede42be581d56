//! Starting a named service and awaiting its readiness.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::LaunchError;
use crate::events::EventBus;
use crate::probe::{self, ReadinessCheck};
use crate::process::ProcessHandle;

/// Everything needed to start one service. Built once per launch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Overrides layered on top of the inherited process environment.
    pub env: BTreeMap<String, String>,
    pub use_shell: bool,
}

impl ServiceSpec {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            use_shell: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn use_shell(mut self, use_shell: bool) -> Self {
        self.use_shell = use_shell;
        self
    }

    pub fn display_command(&self) -> String {
        let mut parts = vec![self.command.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Result of one startup phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum LaunchOutcome {
    Healthy,
    /// Running but never confirmed ready. Startup continues.
    TimedOutDegraded,
    /// Something else already listens on the port; nothing was spawned.
    PortAlreadyOccupied,
    SpawnFailed(String),
}

impl LaunchOutcome {
    /// Every outcome lets startup advance. Only spawn failures are errors.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::SpawnFailed(_))
    }
}

/// What [`ServiceLauncher::start_if_port_free`] did.
#[derive(Debug)]
pub enum Started {
    Spawned(ProcessHandle),
    AlreadyServing,
}

pub struct ServiceLauncher {
    bus: EventBus,
    client: reqwest::Client,
    interval: Duration,
}

impl ServiceLauncher {
    pub fn new(bus: EventBus, interval: Duration) -> Self {
        Self {
            bus,
            client: probe::probe_client(),
            interval,
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawns the service with output relays and exit observer attached.
    pub fn start(&self, spec: &ServiceSpec) -> Result<ProcessHandle, LaunchError> {
        if !spec.working_dir.is_dir() {
            return Err(LaunchError::MissingWorkingDir {
                service: spec.name.clone(),
                path: spec.working_dir.display().to_string(),
            });
        }
        ProcessHandle::spawn(spec, &self.bus)
    }

    /// Like [`start`](Self::start), but first checks whether `host:port` is
    /// already served. A developer-run instance is reused instead of starting
    /// a second one on the same port.
    pub async fn start_if_port_free(
        &self,
        spec: &ServiceSpec,
        host: &str,
        port: u16,
    ) -> Result<Started, LaunchError> {
        if probe::check_port(host, port).await {
            log::info!(
                target: spec.name.as_str(),
                "port {port} already in use; not spawning {}",
                spec.name
            );
            return Ok(Started::AlreadyServing);
        }
        self.start(spec).map(Started::Spawned)
    }

    /// Polls `check` right away (no grace period) until it succeeds or
    /// `timeout` elapses.
    pub async fn await_healthy(
        &self,
        name: &str,
        check: &ReadinessCheck,
        timeout: Duration,
    ) -> LaunchOutcome {
        log::debug!(
            target: name,
            "waiting up to {}ms for {}",
            timeout.as_millis(),
            check.target()
        );
        if probe::wait_for(&self.client, check, timeout, self.interval).await {
            LaunchOutcome::Healthy
        } else {
            LaunchOutcome::TimedOutDegraded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_builder_collects_args_and_env() {
        let spec = ServiceSpec::new("frontend", "npm", "/srv/frontend")
            .args(["run", "dev"])
            .args(["--", "-p", "3000"])
            .env("BROWSER", "none")
            .use_shell(true);

        assert_eq!(spec.args, vec!["run", "dev", "--", "-p", "3000"]);
        assert_eq!(spec.env.get("BROWSER").map(String::as_str), Some("none"));
        assert!(spec.use_shell);
        assert_eq!(spec.display_command(), "npm run dev -- -p 3000");
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(LaunchOutcome::SpawnFailed("boom".into())).unwrap();
        assert_eq!(json, serde_json::json!({"status": "spawn_failed", "reason": "boom"}));
        let json = serde_json::to_value(LaunchOutcome::Healthy).unwrap();
        assert_eq!(json, serde_json::json!({"status": "healthy"}));
    }

    #[tokio::test]
    async fn missing_working_dir_is_reported_not_spawned() {
        let (bus, _rx) = EventBus::channel();
        let launcher = ServiceLauncher::new(bus, Duration::from_millis(50));
        let dir = tempfile::tempdir().unwrap();
        let spec = ServiceSpec::new("backend", "python3", dir.path().join("nope"));

        let err = launcher.start(&spec).unwrap_err();
        assert!(matches!(err, LaunchError::MissingWorkingDir { .. }));
    }

    #[tokio::test]
    async fn occupied_port_skips_spawn() {
        let (bus, _rx) = EventBus::channel();
        let launcher = ServiceLauncher::new(bus, Duration::from_millis(50));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let spec = ServiceSpec::new("frontend", "definitely-not-a-real-binary", dir.path());

        let started = launcher
            .start_if_port_free(&spec, "127.0.0.1", port)
            .await
            .unwrap();
        assert!(matches!(started, Started::AlreadyServing));
    }
}
