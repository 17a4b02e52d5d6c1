//! Runs one generated code file to completion in an isolated Python
//! subprocess, enforcing a wall-clock timeout with a soft interrupt before a
//! hard kill, and an independent startup timeout for a stuck or missing
//! interpreter binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use orch_core::{Error, Result};

/// Grace period after the wall-clock timeout during which a soft interrupt
/// is allowed to let the child unwind before it's killed outright.
const OVERTIME_GRACE: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub term_out: Vec<String>,
    pub exec_time_secs: f64,
    pub exc_type: Option<String>,
    pub exc_message: Option<String>,
    pub exc_stack: Option<String>,
}

impl ExecutionResult {
    pub fn is_buggy(&self) -> bool {
        self.exc_type.is_some()
    }
}

pub struct Interpreter {
    working_dir: PathBuf,
    timeout: Duration,
    startup_timeout: Duration,
    agent_file_name: String,
    python_executable: String,
    env_vars: Vec<(String, String)>,
}

impl Interpreter {
    pub fn new(working_dir: impl AsRef<Path>, timeout_secs: u64, agent_file_name: impl Into<String>) -> Result<Self> {
        let working_dir = working_dir.as_ref().to_path_buf();
        if !working_dir.exists() {
            return Err(Error::internal(format!(
                "working directory {} does not exist",
                working_dir.display()
            )));
        }
        Ok(Self {
            working_dir,
            timeout: Duration::from_secs(timeout_secs),
            startup_timeout: Duration::from_secs(300),
            agent_file_name: agent_file_name.into(),
            python_executable: "python3".to_string(),
            env_vars: Vec::new(),
        })
    }

    pub fn with_startup_timeout(mut self, secs: u64) -> Self {
        self.startup_timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_python_executable(mut self, path: impl Into<String>) -> Self {
        self.python_executable = path.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Write `code` to the agent file and execute it in a fresh subprocess.
    pub async fn run(&self, code: &str) -> Result<ExecutionResult> {
        let script_path = self.working_dir.join(&self.agent_file_name);
        tokio::fs::write(&script_path, code)
            .await
            .map_err(|e| Error::internal(format!("failed to write agent file: {e}")))?;

        let mut command = Command::new(&self.python_executable);
        command
            .arg(&self.agent_file_name)
            .current_dir(&self.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env_vars {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::internal(format!("failed to spawn interpreter: {e}")))?;

        // Drain stdout/stderr concurrently with the wait, not after: a child
        // that writes past the OS pipe buffer before exiting would otherwise
        // block on write while we block in child.wait(), deadlocking until
        // the wall-clock timeout papers over it as a false TimeoutError.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(read_pipe(stdout_pipe));
        let stderr_task = tokio::spawn(read_pipe(stderr_pipe));

        self.wait_for_startup(&mut child).await?;

        let start = Instant::now();
        let status = self.wait_with_timeout(&mut child).await?;
        let exec_time_secs = start.elapsed().as_secs_f64();

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(self.build_result(status, stdout, stderr, exec_time_secs))
    }

    /// The original's readiness handshake has no subprocess analog once
    /// Python is started directly: we instead just confirm the process is
    /// still alive after a brief grace period, catching the common case of a
    /// missing interpreter binary.
    async fn wait_for_startup(&self, child: &mut Child) -> Result<()> {
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if let Some(status) = child.try_wait().map_err(|e| Error::internal(e.to_string()))? {
                if !status.success() {
                    return Ok(()); // exited already; run() will pick up stderr as the failure
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(Error::internal("interpreter failed to start within the startup timeout"));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn wait_with_timeout(&self, child: &mut Child) -> Result<ExitStatusKind> {
        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => Ok(ExitStatusKind::Exited(status.success())),
            Ok(Err(e)) => Err(Error::internal(format!("error waiting on interpreter: {e}"))),
            Err(_) => {
                // soft interrupt, then hard kill after the overtime grace period
                send_interrupt(child);
                match tokio::time::timeout(OVERTIME_GRACE, child.wait()).await {
                    Ok(Ok(_)) => Ok(ExitStatusKind::TimedOut),
                    _ => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        Ok(ExitStatusKind::TimedOut)
                    }
                }
            }
        }
    }

    fn build_result(
        &self,
        status: ExitStatusKind,
        stdout: String,
        stderr: String,
        exec_time_secs: f64,
    ) -> ExecutionResult {
        let mut term_out: Vec<String> = stdout.lines().map(str::to_string).collect();
        term_out.extend(stderr.lines().map(str::to_string));

        match status {
            ExitStatusKind::TimedOut => {
                term_out.push(format!(
                    "TimeoutError: execution exceeded the time limit of {}s",
                    self.timeout.as_secs()
                ));
                ExecutionResult {
                    term_out,
                    exec_time_secs: self.timeout.as_secs_f64(),
                    exc_type: Some("TimeoutError".to_string()),
                    exc_message: Some(format!("exceeded {}s", self.timeout.as_secs())),
                    exc_stack: None,
                }
            }
            ExitStatusKind::Exited(true) => {
                term_out.push(format!("Execution time: {exec_time_secs:.1}s"));
                ExecutionResult {
                    term_out,
                    exec_time_secs,
                    exc_type: None,
                    exc_message: None,
                    exc_stack: None,
                }
            }
            ExitStatusKind::Exited(false) => {
                let (exc_type, exc_message) = parse_traceback_tail(&stderr);
                ExecutionResult {
                    term_out,
                    exec_time_secs,
                    exc_type: Some(exc_type),
                    exc_message,
                    exc_stack: Some(stderr),
                }
            }
        }
    }
}

enum ExitStatusKind {
    Exited(bool),
    TimedOut,
}

/// Drain a child's stdout/stderr pipe to completion. Takes the pipe by value
/// so it can run as its own task alongside the wait/timeout logic, which
/// needs to keep `&mut Child` alive and killable.
async fn read_pipe(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    match pipe {
        Some(mut p) => {
            let mut buf = String::new();
            let _ = p.read_to_string(&mut buf).await;
            buf
        }
        None => String::new(),
    }
}

#[cfg(unix)]
fn send_interrupt(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
    }
}

#[cfg(not(unix))]
fn send_interrupt(_child: &Child) {}

/// Best-effort extraction of `ExceptionType: message` from the last
/// non-empty traceback line, the way CPython formats uncaught exceptions.
fn parse_traceback_tail(stderr: &str) -> (String, Option<String>) {
    let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty());
    match last_line {
        Some(line) => match line.split_once(": ") {
            Some((kind, message)) if !kind.contains(' ') => {
                (kind.to_string(), Some(message.to_string()))
            }
            _ => (line.trim().to_string(), None),
        },
        None => ("UnknownError".to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_code_and_captures_stdout() {
        let dir = tempdir();
        let interp = Interpreter::new(&dir, 30, "runfile.py").unwrap();
        let result = interp.run("print('hello')").await.unwrap();
        assert!(!result.is_buggy());
        assert!(result.term_out.iter().any(|l| l.contains("hello")));
    }

    #[tokio::test]
    async fn captures_uncaught_exceptions() {
        let dir = tempdir();
        let interp = Interpreter::new(&dir, 30, "runfile.py").unwrap();
        let result = interp.run("raise ValueError('boom')").await.unwrap();
        assert!(result.is_buggy());
        assert_eq!(result.exc_type.as_deref(), Some("ValueError"));
    }

    #[tokio::test]
    async fn kills_on_timeout() {
        let dir = tempdir();
        let interp = Interpreter::new(&dir, 1, "runfile.py").unwrap();
        let result = interp.run("import time\ntime.sleep(120)").await.unwrap();
        assert_eq!(result.exc_type.as_deref(), Some("TimeoutError"));
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("orch-exec-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
