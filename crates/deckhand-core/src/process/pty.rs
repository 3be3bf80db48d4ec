//! Pseudo-terminal launch.
//!
//! Runs the CLI attached to a PTY so it behaves as it would in a terminal.
//! Stdout and stderr arrive merged on the master side.

use std::io::Read;
use std::thread;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};

use super::{
    AgentExit, EventSender, ExitSignal, ExitTracker, LaunchMode, LaunchRequest, ProcessEvent,
    ProcessHandle, StopSignal, CHILD_ENV,
};
use crate::error::LaunchError;

/// A CLI process running on a pseudo-terminal.
///
/// The master must be kept alive for as long as the process is attached,
/// otherwise the PTY closes under it.
pub struct PtyProcess {
    pid: Option<u32>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    tracker: ExitTracker,
    _master: Box<dyn MasterPty + Send>,
}

/// Open a PTY and spawn the request on it.
///
/// Output is forwarded as [`ProcessEvent::Stdout`] until the master reports
/// EOF; a watcher thread sends [`ProcessEvent::Exit`] once the child is
/// reaped.
pub fn spawn(request: &LaunchRequest, events: EventSender) -> Result<PtyProcess, LaunchError> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: request.pty_geometry.rows,
            cols: request.pty_geometry.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| LaunchError::Pty(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&request.program);
    cmd.args(&request.args);
    // CommandBuilder defaults to $HOME; the child inherits our cwd instead.
    match request.working_dir.clone().map_or_else(std::env::current_dir, Ok) {
        Ok(dir) => cmd.cwd(dir),
        Err(e) => log::warn!("Cannot determine working directory for PTY child: {}", e),
    }
    for (key, value) in CHILD_ENV {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| LaunchError::Pty(format!("Failed to spawn {}: {}", request.program, e)))?;

    // Only the master side is ours.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| LaunchError::Pty(format!("Failed to clone reader: {}", e)))?;

    let pid = child.process_id();
    let killer = child.clone_killer();
    let tracker = ExitTracker::new();

    let output_tx = events.clone();
    thread::spawn(move || {
        let mut reader = reader;
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.send(ProcessEvent::Stdout(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                // EIO once the slave side closes
                Err(_) => break,
            }
        }
    });

    let exit_tracker = tracker.clone();
    thread::spawn(move || {
        let exit = match child.wait() {
            Ok(status) => exit_from_status(&status),
            Err(e) => {
                log::warn!("Failed to wait for PTY child: {}", e);
                AgentExit {
                    code: None,
                    signal: None,
                }
            }
        };
        exit_tracker.record_exit(exit.clone());
        let _ = events.send(ProcessEvent::Exit(exit));
    });

    log::info!(
        "Spawned {} on a PTY (pid {:?})",
        request.program,
        pid
    );

    Ok(PtyProcess {
        pid,
        killer,
        tracker,
        _master: pair.master,
    })
}

/// Prefix portable-pty puts before the signal name of a signalled child.
const SIGNALLED_PREFIX: &str = "Terminated by ";

/// A signalled child has no meaningful exit code; report the signal alone.
///
/// portable-pty only exposes the signal through `Display` and reports such
/// a child with exit code 1.
fn exit_from_status(status: &portable_pty::ExitStatus) -> AgentExit {
    if !status.success() {
        if let Some(signal) = status.to_string().strip_prefix(SIGNALLED_PREFIX) {
            return AgentExit {
                code: None,
                signal: Some(ExitSignal::Name(signal.to_string())),
            };
        }
    }
    AgentExit::with_code(status.exit_code() as i32)
}

impl ProcessHandle for PtyProcess {
    fn mode(&self) -> LaunchMode {
        LaunchMode::Pty
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&mut self, signal: StopSignal) {
        self.tracker.mark_killed();

        // Once reaped, the pid may already belong to someone else.
        if self.tracker.exit().is_some() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SAFETY: kill(2) has no memory-safety preconditions.
            let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_libc()) };
            if rc == 0 {
                return;
            }
            log::debug!("kill({}, {:?}) failed, using PTY killer", pid, signal);
        }

        if let Err(e) = self.killer.kill() {
            log::debug!("PTY killer failed for {:?}: {}", self.pid, e);
        }
    }

    fn exit_status(&self) -> Option<AgentExit> {
        self.tracker.exit()
    }

    fn is_killed(&self) -> bool {
        self.tracker.killed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod status {
        use super::*;
        use portable_pty::ExitStatus;

        #[test]
        fn exit_codes_pass_through() {
            assert_eq!(
                exit_from_status(&ExitStatus::with_exit_code(0)),
                AgentExit::with_code(0)
            );
            assert_eq!(
                exit_from_status(&ExitStatus::with_exit_code(2)),
                AgentExit::with_code(2)
            );
        }

        #[test]
        fn signal_name_replaces_the_code() {
            let exit = exit_from_status(&ExitStatus::with_signal("Terminated"));
            assert_eq!(exit.code, None);
            assert_eq!(exit.signal, Some(ExitSignal::Name("Terminated".into())));
            assert!(exit.is_clean());

            let exit = exit_from_status(&ExitStatus::with_signal("Killed"));
            assert_eq!(exit.signal, Some(ExitSignal::Name("Killed".into())));
            assert!(!exit.is_clean());
        }
    }

    #[cfg(unix)]
    mod spawning {
        use super::*;
        use crate::config::PtyGeometry;
        use std::sync::mpsc;
        use std::time::Duration;

        fn drain(rx: &mpsc::Receiver<ProcessEvent>) -> (String, Option<AgentExit>) {
            let mut output = Vec::new();
            let mut exit = None;
            while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
                match event {
                    ProcessEvent::Stdout(bytes) => output.extend(bytes),
                    ProcessEvent::Stderr(_) => {}
                    ProcessEvent::Exit(e) => exit = Some(e),
                }
            }
            (String::from_utf8_lossy(&output).into_owned(), exit)
        }

        fn request(program: &str, args: &[&str]) -> LaunchRequest {
            LaunchRequest {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                working_dir: None,
                use_pty: true,
                pty_geometry: PtyGeometry::default(),
            }
        }

        #[test]
        fn missing_program_is_a_launch_error() {
            let (tx, _rx) = mpsc::channel();
            let result = spawn(&request("/nonexistent/deckhand-agent", &[]), tx);
            assert!(result.is_err());
        }

        #[test]
        fn echo_output_and_exit_arrive() {
            let (tx, rx) = mpsc::channel();
            // Hosts without /dev/ptmx cannot run this; the piped fallback covers them.
            let Ok(process) = spawn(&request("/bin/sh", &["-c", "echo hello-pty"]), tx) else {
                return;
            };
            assert_eq!(process.mode(), LaunchMode::Pty);
            assert!(process.pid().is_some());

            let (output, exit) = drain(&rx);
            assert!(output.contains("hello-pty"));
            assert_eq!(exit, Some(AgentExit::with_code(0)));
            assert!(!process.is_alive());
        }

        #[test]
        fn child_inherits_our_working_dir() {
            let (tx, rx) = mpsc::channel();
            let Ok(_process) = spawn(&request("/bin/sh", &["-c", "pwd"]), tx) else {
                return;
            };

            let (output, _) = drain(&rx);
            let reported = std::fs::canonicalize(output.trim()).unwrap();
            let ours = std::fs::canonicalize(std::env::current_dir().unwrap()).unwrap();
            assert_eq!(reported, ours);
        }

        #[test]
        fn explicit_working_dir_wins() {
            let dir = tempfile::tempdir().unwrap();
            let mut req = request("/bin/sh", &["-c", "pwd"]);
            req.working_dir = Some(dir.path().to_path_buf());

            let (tx, rx) = mpsc::channel();
            let Ok(_process) = spawn(&req, tx) else {
                return;
            };

            let (output, _) = drain(&rx);
            let reported = std::fs::canonicalize(output.trim()).unwrap();
            assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
        }

        #[test]
        fn terminated_child_exits_clean() {
            let (tx, rx) = mpsc::channel();
            let Ok(mut process) = spawn(&request("/bin/sh", &["-c", "exec sleep 30"]), tx) else {
                return;
            };
            assert!(process.is_alive());

            process.kill(StopSignal::Terminate);
            assert!(process.is_killed());

            let (_, exit) = drain(&rx);
            let exit = exit.unwrap();
            assert_eq!(exit.code, None);
            assert!(exit.signal.is_some());
            assert!(exit.is_clean(), "{exit:?}");
        }

        #[test]
        fn kill_after_exit_is_a_no_op() {
            let (tx, rx) = mpsc::channel();
            let Ok(mut process) = spawn(&request("/bin/sh", &["-c", "exit 0"]), tx) else {
                return;
            };
            let (_, exit) = drain(&rx);
            assert_eq!(exit, Some(AgentExit::with_code(0)));

            process.kill(StopSignal::Kill);
            assert!(process.is_killed());
            assert_eq!(process.exit_status(), Some(AgentExit::with_code(0)));
        }
    }
}
