//! Process-tree termination on application exit.

use std::time::Duration;

use serde::Serialize;

use crate::error::TerminateError;
use crate::events::SHELL_SOURCE;
use crate::process::ProcessHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum Termination {
    Terminated,
    AlreadyExited,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminationEntry {
    pub service: String,
    pub pid: Option<u32>,
    pub termination: Termination,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub entries: Vec<TerminationEntry>,
}

impl ShutdownReport {
    pub fn get(&self, service: &str) -> Option<&Termination> {
        self.entries
            .iter()
            .find(|entry| entry.service == service)
            .map(|entry| &entry.termination)
    }
}

/// Tree-kills every owned process. Each handle is attempted independently;
/// a failure on one is logged and the rest are still attempted.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownCoordinator {
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    pub fn run(&self, handles: impl IntoIterator<Item = ProcessHandle>) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        for handle in handles {
            let termination = match handle.terminate_tree(self.grace) {
                Ok(()) => {
                    log::info!(
                        target: SHELL_SOURCE,
                        "terminated {} process tree",
                        handle.name()
                    );
                    Termination::Terminated
                }
                Err(TerminateError::AlreadyExited(pid)) => {
                    log::info!(
                        target: SHELL_SOURCE,
                        "{} (pid {pid}) already exited",
                        handle.name()
                    );
                    Termination::AlreadyExited
                }
                Err(err) => {
                    log::warn!(
                        target: SHELL_SOURCE,
                        "failed to terminate {}: {err}",
                        handle.name()
                    );
                    Termination::Failed(err.to_string())
                }
            };
            report.entries.push(TerminationEntry {
                service: handle.name().to_string(),
                pid: handle.pid(),
                termination,
            });
        }
        report
    }
}
