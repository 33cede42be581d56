//! Typed event stream shared by child processes and the display surface.
//!
//! Every producer holds a cloned [`EventBus`]; the supervisor owns the single
//! receiving end and relays each event to the log under its source tag.

use serde::Serialize;
use tokio::sync::mpsc;

/// Log target used for the shell's own lines.
pub const SHELL_SOURCE: &str = "shell";
/// Log target for page-load diagnostics.
pub const RENDERER_SOURCE: &str = "renderer";
/// Log target for console output of the embedded content.
pub const CONSOLE_SOURCE: &str = "console";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SurfaceEvent {
    LoadStarted {
        url: String,
    },
    LoadSucceeded {
        url: String,
    },
    LoadFailed {
        code: Option<i32>,
        description: String,
        url: String,
    },
    Console {
        level: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShellEvent {
    Output {
        source: String,
        stream: OutputStream,
        line: String,
    },
    Exited {
        source: String,
        code: Option<i32>,
        signal: Option<String>,
    },
    Surface(SurfaceEvent),
}

/// Cloneable, non-blocking sender half of the shell event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<ShellEvent>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<ShellEvent>;

impl EventBus {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Posts an event. A closed receiver means the shell is shutting down,
    /// so the event is dropped.
    pub fn emit(&self, event: ShellEvent) {
        let _ = self.tx.send(event);
    }

    pub fn surface(&self, event: SurfaceEvent) {
        self.emit(ShellEvent::Surface(event));
    }
}

/// Writes one event to the log under its source tag.
pub fn relay(event: &ShellEvent) {
    match event {
        ShellEvent::Output {
            source,
            stream: OutputStream::Stdout,
            line,
        } => log::info!(target: source.as_str(), "{line}"),
        ShellEvent::Output {
            source,
            stream: OutputStream::Stderr,
            line,
        } => log::warn!(target: source.as_str(), "{line}"),
        ShellEvent::Exited {
            source,
            code,
            signal,
        } => log::info!(
            target: source.as_str(),
            "exited code={} signal={}",
            code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()),
            signal.as_deref().unwrap_or("none")
        ),
        ShellEvent::Surface(SurfaceEvent::LoadStarted { url }) => {
            log::debug!(target: RENDERER_SOURCE, "load-started url={url}")
        }
        ShellEvent::Surface(SurfaceEvent::LoadSucceeded { url }) => {
            log::info!(target: RENDERER_SOURCE, "did-finish-load url={url}")
        }
        ShellEvent::Surface(SurfaceEvent::LoadFailed {
            code,
            description,
            url,
        }) => log::warn!(
            target: RENDERER_SOURCE,
            "did-fail-load {} {description} url={url}",
            code.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
        ),
        ShellEvent::Surface(SurfaceEvent::Console { level, message }) => match level.as_str() {
            "error" => log::error!(target: CONSOLE_SOURCE, "{message}"),
            "warn" => log::warn!(target: CONSOLE_SOURCE, "{message}"),
            "debug" => log::debug!(target: CONSOLE_SOURCE, "{message}"),
            _ => log::info!(target: CONSOLE_SOURCE, "{message}"),
        },
    }
}

/// Splits a raw output chunk into loggable lines.
pub(crate) fn clean_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
