//! Environment-derived shell configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::launcher::ServiceSpec;
use crate::probe::{ContentKind, ReadinessCheck};
use crate::resolver::{self, Platform};

pub const BACKEND: &str = "backend";
pub const FRONTEND: &str = "frontend";
pub const LOOPBACK: &str = "127.0.0.1";

pub const DEFAULT_FRONTEND_PORT: u16 = 3000;
pub const DEFAULT_BACKEND_HEALTH_URL: &str = "http://127.0.0.1:8000/health";
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_FRONTEND_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const POLL_INTERVAL_MIN_MS: u64 = 50;
const POLL_INTERVAL_MAX_MS: u64 = 10_000;
const TIMEOUT_MAX_MS: u64 = 10 * 60 * 1000;

/// Delay before the single retry of a failed content load.
pub const LOAD_RETRY_DELAY: Duration = Duration::from_millis(1_500);
/// How long a signalled process tree gets before it is force-killed.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(500);
/// Query marker telling the UI it runs inside the desktop shell.
pub const SHELL_QUERY_MARKER: &str = "inShell=1";

pub const FRONTEND_PORT_ENV: &str = "FRONTEND_PORT";
pub const NODE_ENV: &str = "NODE_ENV";
pub const ROOT_ENV: &str = "GAMEMOTION_ROOT";
pub const BACKEND_URL_ENV: &str = "GAMEMOTION_BACKEND_URL";
pub const BACKEND_TIMEOUT_ENV: &str = "GAMEMOTION_BACKEND_TIMEOUT_MS";
pub const FRONTEND_TIMEOUT_ENV: &str = "GAMEMOTION_FRONTEND_TIMEOUT_MS";
pub const POLL_INTERVAL_ENV: &str = "GAMEMOTION_POLL_INTERVAL_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    pub frontend_port: u16,
    pub dev_mode: bool,
    pub root_dir: PathBuf,
    pub backend_health_url: String,
    pub backend_timeout: Duration,
    pub frontend_timeout: Duration,
    pub poll_interval: Duration,
    pub load_retry_delay: Duration,
    pub terminate_grace: Duration,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            frontend_port: DEFAULT_FRONTEND_PORT,
            dev_mode: true,
            root_dir: default_root_dir(),
            backend_health_url: DEFAULT_BACKEND_HEALTH_URL.to_string(),
            backend_timeout: Duration::from_millis(DEFAULT_BACKEND_TIMEOUT_MS),
            frontend_timeout: Duration::from_millis(DEFAULT_FRONTEND_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            load_retry_delay: LOAD_RETRY_DELAY,
            terminate_grace: TERMINATE_GRACE,
        }
    }
}

impl ShellConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup. Bad values
    /// are logged and replaced by defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(raw) = get(FRONTEND_PORT_ENV) {
            match raw.parse::<u16>() {
                Ok(port) if port != 0 => config.frontend_port = port,
                _ => log::warn!(
                    target: "shell",
                    "ignoring invalid {FRONTEND_PORT_ENV}={raw}, using {DEFAULT_FRONTEND_PORT}"
                ),
            }
        }
        config.dev_mode = get(NODE_ENV).as_deref() != Some("production");
        if let Some(root) = get(ROOT_ENV) {
            config.root_dir = PathBuf::from(root);
        }
        if let Some(url) = get(BACKEND_URL_ENV) {
            config.backend_health_url = url;
        }

        let interval_ms = parse_millis(get(POLL_INTERVAL_ENV), POLL_INTERVAL_ENV)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
            .clamp(POLL_INTERVAL_MIN_MS, POLL_INTERVAL_MAX_MS);
        config.poll_interval = Duration::from_millis(interval_ms);
        config.backend_timeout = Duration::from_millis(
            parse_millis(get(BACKEND_TIMEOUT_ENV), BACKEND_TIMEOUT_ENV)
                .unwrap_or(DEFAULT_BACKEND_TIMEOUT_MS)
                .clamp(interval_ms, TIMEOUT_MAX_MS),
        );
        config.frontend_timeout = Duration::from_millis(
            parse_millis(get(FRONTEND_TIMEOUT_ENV), FRONTEND_TIMEOUT_ENV)
                .unwrap_or(DEFAULT_FRONTEND_TIMEOUT_MS)
                .clamp(interval_ms, TIMEOUT_MAX_MS),
        );
        config
    }

    pub fn backend_dir(&self) -> PathBuf {
        self.root_dir.join(BACKEND)
    }

    pub fn frontend_dir(&self) -> PathBuf {
        self.root_dir.join(FRONTEND)
    }

    pub fn frontend_url(&self) -> String {
        format!("http://{LOOPBACK}:{}/", self.frontend_port)
    }

    pub fn content_url(&self) -> String {
        format!("{}?{SHELL_QUERY_MARKER}", self.frontend_url())
    }

    pub fn backend_spec(&self, platform: Platform) -> ServiceSpec {
        let dir = self.backend_dir();
        let python = resolver::resolve(&dir, platform);
        ServiceSpec::new(BACKEND, python, dir)
            .args(["-m", "gamemotion_backend.main"])
            .use_shell(platform.uses_shell())
    }

    pub fn frontend_spec(&self, platform: Platform) -> ServiceSpec {
        ServiceSpec::new(FRONTEND, platform.npm(), self.frontend_dir())
            .args(["run", "dev", "--", "-p"])
            .args([self.frontend_port.to_string()])
            .env("BROWSER", "none")
            .use_shell(platform.uses_shell())
    }

    pub fn backend_check(&self) -> ReadinessCheck {
        ReadinessCheck::http(self.backend_health_url.clone(), &[ContentKind::Json])
    }

    pub fn frontend_check(&self) -> ReadinessCheck {
        ReadinessCheck::http(self.frontend_url(), &[ContentKind::Html, ContentKind::Json])
    }
}

fn parse_millis(raw: Option<String>, key: &str) -> Option<u64> {
    let raw = raw?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!(target: "shell", "ignoring invalid {key}={raw}");
            None
        }
    }
}

fn default_root_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..")
}
