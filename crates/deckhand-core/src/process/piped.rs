//! Plain-pipe launch, used when a PTY is disabled or unavailable.
//!
//! Stdout and stderr are read on separate threads and reported as raw
//! chunks; line splitting happens downstream. A watcher thread polls the
//! child for exit.

use std::io::Read;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{
    AgentExit, EventSender, ExitTracker, LaunchMode, LaunchRequest, ProcessEvent,
    ProcessHandle, StopSignal, CHILD_ENV,
};
use crate::error::LaunchError;
use crate::shell::child_command;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A CLI process with piped stdout/stderr and no stdin.
pub struct PipedProcess {
    pid: u32,
    child: Arc<Mutex<Option<Child>>>,
    tracker: ExitTracker,
}

/// Spawn the request with piped output.
pub fn spawn(request: &LaunchRequest, events: EventSender) -> Result<PipedProcess, LaunchError> {
    let mut cmd = child_command(&request.program, &request.args);
    if let Some(ref dir) = request.working_dir {
        cmd.current_dir(dir);
    }
    cmd.envs(CHILD_ENV)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| LaunchError::Spawn(format!("{}: {}", request.program, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| LaunchError::Spawn("Failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| LaunchError::Spawn("Failed to capture stderr".to_string()))?;

    let pid = child.id();
    let tracker = ExitTracker::new();
    let child = Arc::new(Mutex::new(Some(child)));

    forward_chunks(stdout, events.clone(), ProcessEvent::Stdout);
    forward_chunks(stderr, events.clone(), ProcessEvent::Stderr);

    let child_exit = Arc::clone(&child);
    let exit_tracker = tracker.clone();
    thread::spawn(move || loop {
        let mut guard = child_exit.lock().unwrap_or_else(|e| e.into_inner());
        let Some(child) = guard.as_mut() else {
            break;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                guard.take();
                drop(guard);
                let exit = exit_from_status(status);
                exit_tracker.record_exit(exit.clone());
                let _ = events.send(ProcessEvent::Exit(exit));
                break;
            }
            Ok(None) => {}
            Err(e) => {
                guard.take();
                drop(guard);
                log::warn!("Failed to poll pid {}: {}", pid, e);
                let exit = AgentExit {
                    code: None,
                    signal: None,
                };
                exit_tracker.record_exit(exit.clone());
                let _ = events.send(ProcessEvent::Exit(exit));
                break;
            }
        }
        drop(guard);
        thread::sleep(EXIT_POLL_INTERVAL);
    });

    log::info!("Spawned {} with pipes (pid {})", request.program, pid);

    Ok(PipedProcess {
        pid,
        child,
        tracker,
    })
}

fn forward_chunks<R>(mut reader: R, tx: EventSender, wrap: fn(Vec<u8>) -> ProcessEvent)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(wrap(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(unix)]
fn exit_from_status(status: ExitStatus) -> AgentExit {
    use super::ExitSignal;
    use std::os::unix::process::ExitStatusExt;
    AgentExit {
        code: status.code(),
        signal: status.signal().map(ExitSignal::Number),
    }
}

#[cfg(not(unix))]
fn exit_from_status(status: ExitStatus) -> AgentExit {
    AgentExit {
        code: status.code(),
        signal: None,
    }
}

impl ProcessHandle for PipedProcess {
    fn mode(&self) -> LaunchMode {
        LaunchMode::Piped
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn kill(&mut self, signal: StopSignal) {
        self.tracker.mark_killed();

        let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let Some(child) = guard.as_mut() else {
            return;
        };

        #[cfg(unix)]
        {
            // SAFETY: kill(2) has no memory-safety preconditions; the child
            // has not been reaped while we hold it.
            let rc = unsafe { libc::kill(child.id() as libc::pid_t, signal.as_libc()) };
            if rc == 0 {
                return;
            }
        }
        #[cfg(not(unix))]
        let _ = signal;

        if let Err(e) = child.kill() {
            log::debug!("Failed to kill pid {}: {}", self.pid, e);
        }
    }

    fn exit_status(&self) -> Option<AgentExit> {
        self.tracker.exit()
    }

    fn is_killed(&self) -> bool {
        self.tracker.killed()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::PtyGeometry;
    use crate::process::ExitSignal;
    use std::sync::mpsc;

    fn sh(script: &str) -> LaunchRequest {
        LaunchRequest {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            use_pty: false,
            pty_geometry: PtyGeometry::default(),
        }
    }

    fn collect(rx: &mpsc::Receiver<ProcessEvent>) -> (String, String, Option<AgentExit>) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut exit = None;
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            match event {
                ProcessEvent::Stdout(b) => out.extend(b),
                ProcessEvent::Stderr(b) => err.extend(b),
                ProcessEvent::Exit(e) => exit = Some(e),
            }
        }
        (
            String::from_utf8_lossy(&out).into_owned(),
            String::from_utf8_lossy(&err).into_owned(),
            exit,
        )
    }

    #[test]
    fn streams_are_kept_apart() {
        let (tx, rx) = mpsc::channel();
        let process = spawn(&sh("echo out; echo err 1>&2; exit 3"), tx).unwrap();
        assert_eq!(process.mode(), LaunchMode::Piped);

        let (out, err, exit) = collect(&rx);
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
        assert_eq!(exit, Some(AgentExit::with_code(3)));
        assert!(!process.is_alive());
    }

    #[test]
    fn child_env_is_forced() {
        let (tx, rx) = mpsc::channel();
        let _process = spawn(&sh("echo $FORCE_COLOR $PYTHONUNBUFFERED"), tx).unwrap();
        let (out, _, _) = collect(&rx);
        assert_eq!(out, "0 1\n");
    }

    #[test]
    fn working_dir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = sh("pwd");
        request.working_dir = Some(dir.path().to_path_buf());

        let (tx, rx) = mpsc::channel();
        let _process = spawn(&request, tx).unwrap();
        let (out, _, _) = collect(&rx);
        let reported = std::fs::canonicalize(out.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn terminate_reports_signal() {
        let (tx, rx) = mpsc::channel();
        let mut process = spawn(&sh("exec sleep 30"), tx).unwrap();
        assert!(process.is_alive());

        process.kill(StopSignal::Terminate);
        assert!(process.is_killed());
        assert!(!process.is_alive());

        let (_, _, exit) = collect(&rx);
        let exit = exit.unwrap();
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(ExitSignal::Number(15)));
        assert!(exit.is_clean());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let (tx, _rx) = mpsc::channel();
        let request = LaunchRequest {
            program: "/nonexistent/deckhand-agent".to_string(),
            ..sh("")
        };
        assert!(matches!(spawn(&request, tx), Err(LaunchError::Spawn(_))));
    }
}
