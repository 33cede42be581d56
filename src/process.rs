//! Ownership of one spawned service process.
//!
//! Output is relayed line by line onto the [`EventBus`] from background
//! readers, and a waiter task records the exit status. Termination always
//! targets the whole process tree, since on Windows the direct child is a
//! `cmd` wrapper around the real worker.

use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use crate::error::{LaunchError, TerminateError};
use crate::events::{clean_line, EventBus, OutputStream, ShellEvent};
use crate::launcher::ServiceSpec;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(target_os = "windows")]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    spawned_at: DateTime<Utc>,
    exit: watch::Receiver<Option<ExitRecord>>,
}

impl ProcessHandle {
    /// Spawns `spec` and attaches the stdout/stderr relays and the exit
    /// observer. Must be called from within a tokio runtime.
    pub fn spawn(spec: &ServiceSpec, bus: &EventBus) -> Result<Self, LaunchError> {
        let mut cmd = build_command(spec);
        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            service: spec.name.clone(),
            source,
        })?;
        let pid = child.id();
        log::info!(
            target: spec.name.as_str(),
            "spawned pid={} cmd={}",
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            spec.display_command()
        );

        if let Some(stdout) = child.stdout.take() {
            relay_output(stdout, spec.name.clone(), OutputStream::Stdout, bus.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            relay_output(stderr, spec.name.clone(), OutputStream::Stderr, bus.clone());
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let source = spec.name.clone();
        let exit_bus = bus.clone();
        tokio::spawn(async move {
            let record = match child.wait().await {
                Ok(status) => exit_record(status),
                Err(err) => {
                    log::warn!(target: source.as_str(), "failed to observe exit: {err}");
                    ExitRecord {
                        code: None,
                        signal: None,
                    }
                }
            };
            let event = ShellEvent::Exited {
                source,
                code: record.code,
                signal: record.signal.clone(),
            };
            // The handle must already read as exited when the event is seen.
            let _ = exit_tx.send(Some(record));
            exit_bus.emit(event);
        });

        Ok(Self {
            name: spec.name.clone(),
            pid,
            spawned_at: Utc::now(),
            exit: exit_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    pub fn exit_record(&self) -> Option<ExitRecord> {
        self.exit.borrow().clone()
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.exit.borrow().as_ref().and_then(|r| r.code)
    }

    pub fn last_exit_signal(&self) -> Option<String> {
        self.exit.borrow().as_ref().and_then(|r| r.signal.clone())
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Resolves once the process has exited.
    pub async fn wait_exit(&self) -> ExitRecord {
        let mut rx = self.exit.clone();
        loop {
            if let Some(record) = rx.borrow_and_update().clone() {
                return record;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone().unwrap_or(ExitRecord {
                    code: None,
                    signal: None,
                });
            }
        }
    }

    /// Terminates the process and every descendant. Blocking, bounded by
    /// `grace` plus the cost of one kill syscall or `taskkill` run.
    pub fn terminate_tree(&self, grace: Duration) -> Result<(), TerminateError> {
        let pid = self
            .pid
            .ok_or_else(|| TerminateError::NoPid(self.name.clone()))?;
        kill_tree(pid, grace)
    }
}

fn build_command(spec: &ServiceSpec) -> Command {
    let mut cmd = if spec.use_shell {
        shell_command(spec)
    } else {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        cmd
    };
    cmd.current_dir(&spec.working_dir)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    #[cfg(unix)]
    {
        // New session: the child's pid doubles as its process-group id, which
        // is what `kill_tree` signals.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(target_os = "windows")]
    {
        cmd.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
    }
    cmd
}

#[cfg(target_os = "windows")]
fn shell_command(spec: &ServiceSpec) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(&spec.command).args(&spec.args);
    cmd
}

#[cfg(not(target_os = "windows"))]
fn shell_command(spec: &ServiceSpec) -> Command {
    let mut line = shell_quote(&spec.command.to_string_lossy());
    for arg in &spec.args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(not(target_os = "windows"))]
fn shell_quote(raw: &str) -> String {
    let plain = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        raw.to_string()
    } else {
        format!("'{}'", raw.replace('\'', r"'\''"))
    }
}

fn relay_output<R>(reader: R, source: String, stream: OutputStream, bus: EventBus)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if let Some(line) = clean_line(&buf) {
                        bus.emit(ShellEvent::Output {
                            source: source.clone(),
                            stream,
                            line,
                        });
                    }
                }
                Err(err) => {
                    log::debug!(target: source.as_str(), "output relay stopped: {err}");
                    break;
                }
            }
        }
    });
}

fn exit_record(status: std::process::ExitStatus) -> ExitRecord {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        ExitRecord {
            code: status.code(),
            signal: status.signal().map(signal_name),
        }
    }
    #[cfg(not(unix))]
    {
        ExitRecord {
            code: status.code(),
            signal: None,
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGABRT => "SIGABRT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGTERM => "SIGTERM",
        other => return format!("SIG{other}"),
    };
    name.to_string()
}

#[cfg(unix)]
fn signal_group(pgid: libc::pid_t, signal: libc::c_int) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn kill_tree(pid: u32, grace: Duration) -> Result<(), TerminateError> {
    let pgid = pid as libc::pid_t;
    match signal_group(pgid, libc::SIGTERM) {
        Ok(()) => {}
        Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {
            return Err(TerminateError::AlreadyExited(pid));
        }
        Err(source) => return Err(TerminateError::Signal { pid, source }),
    }

    let deadline = std::time::Instant::now() + grace;
    while std::time::Instant::now() < deadline {
        if signal_group(pgid, 0).is_err() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(25));
    }

    match signal_group(pgid, libc::SIGKILL) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::ESRCH) => Ok(()),
        Err(source) => Err(TerminateError::Signal { pid, source }),
    }
}

#[cfg(target_os = "windows")]
fn kill_tree(pid: u32, _grace: Duration) -> Result<(), TerminateError> {
    use std::os::windows::process::CommandExt;

    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .map_err(|source| TerminateError::Signal { pid, source })?;
    if output.status.success() {
        return Ok(());
    }
    let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if taskkill_found_nothing(output.status.code(), &detail) {
        Err(TerminateError::AlreadyExited(pid))
    } else {
        Err(TerminateError::Tool { pid, detail })
    }
}

/// `taskkill` exits with 128 when no process matches the pid. The English
/// message is only a fallback, since it is localized.
#[cfg(any(target_os = "windows", test))]
fn taskkill_found_nothing(code: Option<i32>, stderr: &str) -> bool {
    code == Some(128) || stderr.to_ascii_lowercase().contains("not found")
}

#[cfg(all(test, not(target_os = "windows")))]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_leaves_plain_words() {
        assert_eq!(shell_quote("npm"), "npm");
        assert_eq!(shell_quote("-p"), "-p");
        assert_eq!(shell_quote("gamemotion_backend.main"), "gamemotion_backend.main");
    }

    #[test]
    fn shell_quote_wraps_spaces_and_quotes() {
        assert_eq!(shell_quote("my dir/python"), "'my dir/python'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_name(libc::SIGTERM), "SIGTERM");
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(64), "SIG64");
    }

    #[test]
    fn taskkill_exit_128_means_already_gone() {
        assert!(taskkill_found_nothing(Some(128), "FEHLER: Der Prozess \"4242\" wurde nicht gefunden."));
        assert!(!taskkill_found_nothing(Some(1), "ERROR: The process with PID 4242 could not be terminated."));
        assert!(taskkill_found_nothing(Some(1), "ERROR: The process \"4242\" not found."));
        assert!(taskkill_found_nothing(None, "ERROR: The process \"4242\" not found."));
        assert!(!taskkill_found_nothing(None, "Access is denied."));
    }
}
