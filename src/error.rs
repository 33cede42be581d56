//! Error types for the launch supervisor.
//!
//! None of these are fatal to the shell. Callers match on them, log, and
//! continue with the next phase.

use thiserror::Error;

/// Failures while starting a service process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The OS refused to create the process (missing binary, bad cwd, ...).
    #[error("failed to spawn {service}: {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },

    /// The working directory for the service does not exist.
    #[error("working directory for {service} not found: {path}")]
    MissingWorkingDir { service: String, path: String },

    /// A process with this name is already owned by the supervisor.
    #[error("{0} is already running")]
    AlreadyRunning(String),
}

/// Failures during process-tree termination.
#[derive(Debug, Error)]
pub enum TerminateError {
    /// The process (group) no longer exists.
    #[error("pid {0} already exited")]
    AlreadyExited(u32),

    /// The process was spawned but never reported a pid.
    #[error("no pid recorded for {0}")]
    NoPid(String),

    /// The OS rejected the signal (e.g. permission denied).
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// The platform kill tool ran but reported failure.
    #[error("tree-kill of pid {pid} failed: {detail}")]
    Tool { pid: u32, detail: String },
}

/// Failures reported by the display surface.
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("invalid content url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("content load failed: {0}")]
    Load(String),

    #[error("surface window unavailable: {0}")]
    Window(String),

    #[error("surface is closed")]
    Closed,
}
