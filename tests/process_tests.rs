//! Process handle and shutdown behavior with real child processes.
#![cfg(unix)]

use std::time::Duration;

use gamemotion_shell_lib::error::{LaunchError, TerminateError};
use gamemotion_shell_lib::events::{EventBus, EventReceiver, OutputStream, ShellEvent};
use gamemotion_shell_lib::launcher::ServiceSpec;
use gamemotion_shell_lib::process::ProcessHandle;
use gamemotion_shell_lib::shutdown::{ShutdownCoordinator, Termination};
use tokio::time::timeout;

const GRACE: Duration = Duration::from_millis(500);

fn sh(name: &str, script: &str) -> ServiceSpec {
    ServiceSpec::new(name, "sh", std::env::temp_dir()).args(["-c", script])
}

async fn collect_until_exit(rx: &mut EventReceiver) -> Vec<ShellEvent> {
    let mut out = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_secs(5), rx.recv()).await {
        let done = matches!(event, ShellEvent::Exited { .. });
        out.push(event);
        if done {
            break;
        }
    }
    out
}

#[tokio::test]
async fn relays_output_lines_tagged_with_service() {
    let (bus, mut rx) = EventBus::channel();
    let handle = ProcessHandle::spawn(
        &sh("backend", "echo one; echo two; echo oops 1>&2; sleep 0.2"),
        &bus,
    )
    .unwrap();
    assert!(handle.pid().is_some());

    let events = collect_until_exit(&mut rx).await;
    let stdout: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ShellEvent::Output {
                source,
                stream: OutputStream::Stdout,
                line,
            } if source == "backend" => Some(line.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(stdout, vec!["one", "two"]);
    assert!(events.iter().any(|e| matches!(
        e,
        ShellEvent::Output { stream: OutputStream::Stderr, line, .. } if line == "oops"
    )));
    assert!(matches!(
        events.last(),
        Some(ShellEvent::Exited { source, code: Some(0), .. }) if source == "backend"
    ));
}

#[tokio::test]
async fn records_exit_code() {
    let (bus, _rx) = EventBus::channel();
    let handle = ProcessHandle::spawn(&sh("backend", "exit 3"), &bus).unwrap();
    let record = timeout(Duration::from_secs(5), handle.wait_exit()).await.unwrap();
    assert_eq!(record.code, Some(3));
    assert_eq!(record.signal, None);
    assert!(handle.has_exited());
    assert_eq!(handle.last_exit_code(), Some(3));
}

#[tokio::test]
async fn env_overrides_reach_the_child() {
    let (bus, mut rx) = EventBus::channel();
    let spec = sh("frontend", "echo \"browser=$BROWSER\"").env("BROWSER", "none");
    let _handle = ProcessHandle::spawn(&spec, &bus).unwrap();

    let events = collect_until_exit(&mut rx).await;
    assert!(events.iter().any(|e| matches!(
        e,
        ShellEvent::Output { line, .. } if line == "browser=none"
    )));
}

#[tokio::test]
async fn shell_invocation_runs_through_sh() {
    let (bus, mut rx) = EventBus::channel();
    let spec = ServiceSpec::new("frontend", "echo", std::env::temp_dir())
        .args(["hello world"])
        .use_shell(true);
    let _handle = ProcessHandle::spawn(&spec, &bus).unwrap();

    let events = collect_until_exit(&mut rx).await;
    assert!(events.iter().any(|e| matches!(
        e,
        ShellEvent::Output { line, .. } if line == "hello world"
    )));
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let (bus, _rx) = EventBus::channel();
    let spec = ServiceSpec::new("backend", "gamemotion-no-such-binary", std::env::temp_dir());
    let err = ProcessHandle::spawn(&spec, &bus).unwrap_err();
    assert!(matches!(err, LaunchError::Spawn { ref service, .. } if service == "backend"));
}

#[tokio::test]
async fn terminate_tree_reports_signal() {
    let (bus, _rx) = EventBus::channel();
    let handle = ProcessHandle::spawn(&sh("backend", "exec sleep 30"), &bus).unwrap();

    handle.terminate_tree(GRACE).unwrap();
    let record = timeout(Duration::from_secs(5), handle.wait_exit()).await.unwrap();
    assert_eq!(record.code, None);
    assert_eq!(record.signal.as_deref(), Some("SIGTERM"));
    assert_eq!(handle.last_exit_signal().as_deref(), Some("SIGTERM"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exit_state_is_recorded_before_exit_event() {
    for _ in 0..20 {
        let (bus, mut rx) = EventBus::channel();
        let handle = ProcessHandle::spawn(&sh("backend", "exit 7"), &bus).unwrap();

        let events = collect_until_exit(&mut rx).await;
        assert!(matches!(events.last(), Some(ShellEvent::Exited { code: Some(7), .. })));
        assert!(handle.has_exited());
        assert_eq!(handle.exit_record().and_then(|r| r.code), Some(7));
    }
}

#[tokio::test]
async fn terminate_after_exit_is_already_exited() {
    let (bus, _rx) = EventBus::channel();
    let handle = ProcessHandle::spawn(&sh("backend", "exit 0"), &bus).unwrap();
    timeout(Duration::from_secs(5), handle.wait_exit()).await.unwrap();

    let err = handle.terminate_tree(GRACE).unwrap_err();
    assert!(matches!(err, TerminateError::AlreadyExited(_)));
}

#[cfg(target_os = "linux")]
fn is_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .map(|state| state == "Z" || state == "X")
            .unwrap_or(true),
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn terminate_tree_reaches_grandchildren() {
    let (bus, mut rx) = EventBus::channel();
    let handle = ProcessHandle::spawn(&sh("frontend", "sleep 30 & echo $!; wait"), &bus).unwrap();

    let grandchild: u32 = loop {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(ShellEvent::Output { line, .. })) => break line.trim().parse().unwrap(),
            Ok(Some(_)) => continue,
            other => panic!("no pid line from wrapper: {other:?}"),
        }
    };
    assert!(!is_gone(grandchild));

    handle.terminate_tree(GRACE).unwrap();
    timeout(Duration::from_secs(5), handle.wait_exit()).await.unwrap();

    let mut gone = false;
    for _ in 0..40 {
        if is_gone(grandchild) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "grandchild {grandchild} survived tree-kill");
}

#[tokio::test]
async fn shutdown_continues_past_exited_process() {
    let (bus, _rx) = EventBus::channel();
    let exited = ProcessHandle::spawn(&sh("backend", "exit 0"), &bus).unwrap();
    timeout(Duration::from_secs(5), exited.wait_exit()).await.unwrap();
    let live = ProcessHandle::spawn(&sh("frontend", "exec sleep 30"), &bus).unwrap();
    let live_pid = live.pid();

    let report = ShutdownCoordinator::new(GRACE).run(vec![exited, live]);

    assert_eq!(report.entries.len(), 2);
    assert_eq!(report.get("backend"), Some(&Termination::AlreadyExited));
    assert_eq!(report.get("frontend"), Some(&Termination::Terminated));
    assert_eq!(report.entries[1].pid, live_pid);

    #[cfg(target_os = "linux")]
    {
        let pid = live_pid.unwrap();
        let mut gone = false;
        for _ in 0..40 {
            if is_gone(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "frontend pid {pid} survived shutdown");
    }
}
