//! Child process execution
//!
//! This module backs `envy.run`:
//! - Spawning the selected shell with the hook's command string
//! - Draining stdout/stderr on separate threads so large interleaved
//!   output cannot deadlock the child
//! - Capture vs streaming vs quiet output modes
//! - Terminating the child when the run is cancelled

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation flag shared by the scheduler, the sandbox,
/// and every child process watchdog.
#[derive(Clone, Debug, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shell interpreter selection for `envy.run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Sh,
    Bash,
    Cmd,
    Powershell,
}

impl Shell {
    /// The per-platform default: `sh` on unix, `cmd` on windows.
    pub fn default_for_platform() -> Self {
        if cfg!(windows) {
            Shell::Cmd
        } else {
            Shell::Sh
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "sh" => Ok(Shell::Sh),
            "bash" => Ok(Shell::Bash),
            "cmd" => Ok(Shell::Cmd),
            "powershell" => Ok(Shell::Powershell),
            other => Err(Error::Interface(format!(
                "unknown shell '{}' (expected sh, bash, cmd, or powershell)",
                other
            ))),
        }
    }

    fn command(&self, script: &str) -> Command {
        match self {
            Shell::Sh => {
                let mut cmd = Command::new("sh");
                cmd.args(["-c", script]);
                cmd
            }
            Shell::Bash => {
                let mut cmd = Command::new("bash");
                cmd.args(["-c", script]);
                cmd
            }
            Shell::Cmd => {
                let mut cmd = Command::new("cmd");
                cmd.args(["/C", script]);
                cmd
            }
            Shell::Powershell => {
                let mut cmd = Command::new("powershell");
                cmd.args(["-NoProfile", "-Command", script]);
                cmd
            }
        }
    }
}

/// Options for one `envy.run` invocation.
pub struct RunRequest<'a> {
    pub command: &'a str,
    pub cwd: &'a Path,
    pub env: BTreeMap<String, String>,
    pub capture: bool,
    pub quiet: bool,
    pub check: bool,
    pub shell: Shell,
    pub stop: StopToken,
}

impl<'a> RunRequest<'a> {
    pub fn new(command: &'a str, cwd: &'a Path) -> Self {
        Self {
            command,
            cwd,
            env: BTreeMap::new(),
            capture: false,
            quiet: false,
            check: true,
            shell: Shell::default_for_platform(),
            stop: StopToken::new(),
        }
    }
}

/// Result of a child process run. `stdout`/`stderr` are populated only
/// when capture was requested.
#[derive(Debug)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run a shell command to completion.
///
/// Both output pipes are drained concurrently; with `capture` the bytes
/// are collected, otherwise each line streams to this process's stderr
/// (suppressed by `quiet`). With `check`, a non-zero exit becomes a
/// phase error carrying the exit code.
pub fn run(req: RunRequest) -> Result<RunOutput> {
    let mut cmd = req.shell.command(req.command);
    cmd.current_dir(req.cwd);
    for (key, value) in &req.env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        Error::Phase(format!("failed to spawn {:?} for run: {}", req.shell, e))
    })?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let capture = req.capture;
    let quiet = req.quiet;

    let out_thread = spawn_drain(stdout, capture, quiet);
    let err_thread = spawn_drain(stderr, capture, quiet);

    // Watchdog: when the shared stop flag is raised, terminate the child
    // (SIGTERM first on unix, hard kill after a grace period).
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let stop = req.stop.clone();
    #[cfg(unix)]
    let child_pid = child.id();
    let watchdog = std::thread::spawn(move || {
        loop {
            match done_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return false,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if stop.is_stopped() {
                        #[cfg(unix)]
                        unsafe {
                            libc::kill(child_pid as libc::pid_t, libc::SIGTERM);
                        }
                        // Give the child a moment to exit cleanly, then
                        // let the parent's kill() finish it.
                        std::thread::sleep(Duration::from_secs(5));
                        return true;
                    }
                }
            }
        }
    });

    let status = child.wait()?;
    let _ = done_tx.send(());
    let terminated = watchdog.join().unwrap_or(false);

    let stdout = out_thread.join().unwrap_or_default();
    let stderr = err_thread.join().unwrap_or_default();

    if terminated || req.stop.is_stopped() {
        let _ = child.kill();
        return Err(Error::Phase("run cancelled".to_string()));
    }

    let exit_code = status.code().unwrap_or(-1);
    if req.check && exit_code != 0 {
        return Err(Error::Phase(format!(
            "command exited with status {}: {}",
            exit_code,
            first_line(req.command)
        )));
    }

    Ok(RunOutput {
        exit_code,
        stdout,
        stderr,
    })
}

fn spawn_drain<R: std::io::Read + Send + 'static>(
    pipe: R,
    capture: bool,
    quiet: bool,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut collected = String::new();
        let reader = BufReader::new(pipe);
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if capture {
                collected.push_str(&line);
                collected.push('\n');
            } else if !quiet {
                eprintln!("{}", line);
            }
        }
        collected
    })
}

fn first_line(command: &str) -> &str {
    command.lines().next().unwrap_or(command).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[cfg(unix)]
    #[test]
    fn test_capture_collects_stdout() {
        let temp = TempDir::new().unwrap();
        let mut req = RunRequest::new("echo hello", temp.path());
        req.capture = true;
        let out = run(req).unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_check_true_raises_on_nonzero() {
        let temp = TempDir::new().unwrap();
        let req = RunRequest::new("exit 7", temp.path());
        let err = run(req).unwrap_err();
        assert!(err.to_string().contains("status 7"));
    }

    #[cfg(unix)]
    #[test]
    fn test_check_false_returns_exit_code() {
        let temp = TempDir::new().unwrap();
        let mut req = RunRequest::new("exit 7", temp.path());
        req.check = false;
        req.capture = true;
        let out = run(req).unwrap();
        assert_eq!(out.exit_code, 7);
    }

    #[cfg(unix)]
    #[test]
    fn test_cwd_and_env_are_applied() {
        let temp = TempDir::new().unwrap();
        let mut req = RunRequest::new("pwd && printf '%s' \"$MY_VAR\"", temp.path());
        req.capture = true;
        req.env.insert("MY_VAR".to_string(), "val".to_string());
        let out = run(req).unwrap();
        let canonical = temp.path().canonicalize().unwrap();
        assert!(out.stdout.contains(&canonical.display().to_string()));
        assert!(out.stdout.ends_with("val"));
    }

    #[cfg(unix)]
    #[test]
    fn test_large_interleaved_output_does_not_deadlock() {
        let temp = TempDir::new().unwrap();
        // Well past any pipe buffer on both channels.
        let script = "i=0; while [ $i -lt 20000 ]; do echo line_$i; echo err_$i 1>&2; i=$((i+1)); done";
        let mut req = RunRequest::new(script, temp.path());
        req.capture = true;
        let out = run(req).unwrap();
        assert!(out.stdout.contains("line_19999"));
        assert!(out.stderr.contains("err_19999"));
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_token_cancels_child() {
        let temp = TempDir::new().unwrap();
        let stop = StopToken::new();
        let stopper = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            stopper.stop();
        });
        let mut req = RunRequest::new("sleep 30", temp.path());
        req.stop = stop;
        let start = std::time::Instant::now();
        let result = run(req);
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn test_shell_parse() {
        assert_eq!(Shell::parse("bash").unwrap(), Shell::Bash);
        assert_eq!(Shell::parse("powershell").unwrap(), Shell::Powershell);
        assert!(Shell::parse("fish").is_err());
    }
}
