//! The `Worker` capability contract and its default subprocess backend.
//!
//! `Worker` captures "one long-lived external process acting as a unit of
//! execution" as an object-safe, async trait -- any back-end satisfying
//! it (a real LLM CLI, a local-model bridge) is interchangeable, per the
//! spec's "dynamic dispatch over instance backend" design note. The core
//! only ever sees this contract; [`ProcessWorker`] is the generic
//! shell-subprocess implementation it ships with.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{Payload, TaskResult};

/// Adapter interface for spawning and driving one worker process.
///
/// Object-safe so it can be stored as `Box<dyn Worker>` in the
/// [`crate::pool::InstancePool`]'s roster.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Spawn the backing child process. Must be called before `execute`.
    async fn start(&mut self) -> Result<(), EngineError>;

    /// Run one unit of work to completion or timeout.
    ///
    /// Precondition: the worker has been started and is not already
    /// executing another task.
    async fn execute(&mut self, payload: &Payload, timeout: Duration) -> TaskResult;

    /// Send a polite termination, wait up to `grace`, then force-kill.
    /// Idempotent.
    async fn stop(&mut self, grace: Duration);

    /// Cheap, non-blocking liveness check.
    async fn health_probe(&mut self) -> bool;

    /// The most recent bytes of stdout, oldest-dropped, bounded.
    async fn recent_output(&self) -> String;
}

/// Bounded ring buffer of recent process output lines.
struct OutputBuffer {
    lines: VecDeque<String>,
    byte_budget: usize,
    bytes_used: usize,
}

impl OutputBuffer {
    fn new(byte_budget: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            byte_budget,
            bytes_used: 0,
        }
    }

    fn push(&mut self, line: String) {
        self.bytes_used += line.len();
        self.lines.push_back(line);
        while self.bytes_used > self.byte_budget {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes_used -= dropped.len();
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Generic subprocess-backed [`Worker`].
///
/// Wraps a single long-lived child process. Each `execute()` writes the
/// payload to stdin followed by a generated end-of-response sentinel,
/// then reads stdout lines until that sentinel reappears or the task
/// timeout elapses. `Payload::Command` is translated into a shell
/// invocation; `Payload::Prompt` is written verbatim -- this generic
/// backend does not understand natural-language prompts, it only
/// satisfies the contract.
pub struct ProcessWorker {
    command: Vec<String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader: Option<tokio::io::Lines<BufReader<tokio::process::ChildStdout>>>,
    output: Mutex<OutputBuffer>,
}

impl ProcessWorker {
    pub fn new(command: Vec<String>, output_buffer_bytes: usize) -> Self {
        Self {
            command,
            child: None,
            stdin: None,
            reader: None,
            output: Mutex::new(OutputBuffer::new(output_buffer_bytes)),
        }
    }

    fn sentinel() -> String {
        format!("__MUSTER_EOR_{}__", Uuid::new_v4().simple())
    }

    fn render(payload: &Payload, sentinel: &str) -> String {
        match payload {
            Payload::Prompt { prompt } => format!("{prompt}\necho {sentinel} $?\n"),
            Payload::Command {
                command,
                working_directory,
            } => match working_directory {
                Some(dir) => format!("cd {dir} && {{ {command} ; }}; echo {sentinel} $?\n"),
                None => format!("{{ {command} ; }}; echo {sentinel} $?\n"),
            },
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn start(&mut self) -> Result<(), EngineError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| EngineError::Configuration("empty worker_command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::WorkerStartFailure(e.to_string()))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::WorkerStartFailure("no stdout pipe".to_string()))?;

        self.reader = Some(BufReader::new(stdout).lines());
        self.stdin = stdin;
        self.child = Some(child);
        Ok(())
    }

    async fn execute(&mut self, payload: &Payload, timeout: Duration) -> TaskResult {
        let start = std::time::Instant::now();
        let sentinel = Self::sentinel();

        let Some(stdin) = self.stdin.as_mut() else {
            return TaskResult::failure("worker not started", start.elapsed());
        };

        if let Err(e) = stdin.write_all(Self::render(payload, &sentinel).as_bytes()).await {
            return TaskResult::failure(format!("process-exited: {e}"), start.elapsed());
        }
        if let Err(e) = stdin.flush().await {
            return TaskResult::failure(format!("process-exited: {e}"), start.elapsed());
        }

        let Some(reader) = self.reader.as_mut() else {
            return TaskResult::failure("worker not started", start.elapsed());
        };
        let output = &self.output;

        let read_fut = async move {
            let mut collected = Vec::new();
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(rest) = line.strip_prefix(&sentinel) {
                            let exit_code: i32 = rest.trim().parse().unwrap_or(0);
                            return Ok((collected, exit_code));
                        }
                        {
                            let mut buf = output.lock().await;
                            buf.push(line.clone());
                        }
                        collected.push(line);
                    }
                    Ok(None) => return Err("process-exited".to_string()),
                    Err(e) => return Err(format!("process-exited: {e}")),
                }
            }
        };

        match tokio::time::timeout(timeout, read_fut).await {
            Ok(Ok((lines, exit_code))) => {
                let output = lines.join("\n");
                let duration = start.elapsed();
                if exit_code == 0 {
                    TaskResult::success(output, duration)
                } else {
                    TaskResult {
                        output,
                        exit_code,
                        error: Some(format!("exit code {exit_code}")),
                        duration,
                    }
                }
            }
            Ok(Err(e)) => TaskResult::failure(e, start.elapsed()),
            Err(_) => TaskResult::failure("timeout", start.elapsed()),
        }
    }

    async fn stop(&mut self, grace: Duration) {
        let Some(child) = self.child.as_mut() else {
            return;
        };

        if let Some(pid) = child.id() {
            #[cfg(unix)]
            {
                // SAFETY: pid is a valid u32 belonging to a child we spawned.
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
                }
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(_)) => debug!("worker process exited after SIGTERM"),
            _ => {
                debug!("worker process did not exit after SIGTERM, sending SIGKILL");
                let _ = child.kill().await;
            }
        }

        self.child = None;
        self.stdin = None;
        self.reader = None;
    }

    async fn health_probe(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn recent_output(&self) -> String {
        self.output.lock().await.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn script(tmp: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = tmp.path().join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn command_payload_reports_success() {
        let tmp = tempfile::tempdir().unwrap();
        let mut worker = ProcessWorker::new(vec!["/bin/sh".to_string()], 64 * 1024);
        worker.start().await.unwrap();

        let result = worker
            .execute(
                &Payload::Command {
                    command: "echo hello".to_string(),
                    working_directory: None,
                },
                Duration::from_secs(5),
            )
            .await;

        assert!(result.is_success());
        assert!(result.output.contains("hello"));
        let _ = tmp;
    }

    #[tokio::test]
    async fn command_payload_reports_nonzero_exit() {
        let mut worker = ProcessWorker::new(vec!["/bin/sh".to_string()], 64 * 1024);
        worker.start().await.unwrap();

        let result = worker
            .execute(
                &Payload::Command {
                    command: "exit 7".to_string(),
                    working_directory: None,
                },
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(result.exit_code, 7);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn hanging_command_times_out() {
        let mut worker = ProcessWorker::new(vec!["/bin/sh".to_string()], 64 * 1024);
        worker.start().await.unwrap();

        let result = worker
            .execute(
                &Payload::Command {
                    command: "sleep 5".to_string(),
                    working_directory: None,
                },
                Duration::from_millis(200),
            )
            .await;

        assert_eq!(result.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn start_with_nonexistent_binary_fails() {
        let mut worker = ProcessWorker::new(vec!["/nonexistent/binary".to_string()], 64 * 1024);
        assert!(worker.start().await.is_err());
    }

    #[tokio::test]
    async fn stop_terminates_hanging_process() {
        let mut worker = ProcessWorker::new(vec!["/bin/sh".to_string()], 64 * 1024);
        worker.start().await.unwrap();
        assert!(worker.health_probe().await);
        worker.stop(Duration::from_millis(500)).await;
        assert!(!worker.health_probe().await);
    }

    #[tokio::test]
    async fn recent_output_reflects_executed_commands() {
        let mut worker = ProcessWorker::new(vec!["/bin/sh".to_string()], 64 * 1024);
        worker.start().await.unwrap();
        let _ = worker
            .execute(
                &Payload::Command {
                    command: "echo marker-line".to_string(),
                    working_directory: None,
                },
                Duration::from_secs(5),
            )
            .await;
        assert!(worker.recent_output().await.contains("marker-line"));
    }

    #[tokio::test]
    async fn output_buffer_drops_oldest_when_over_budget() {
        let mut buf = OutputBuffer::new(10);
        buf.push("0123456789".to_string());
        buf.push("more".to_string());
        assert!(buf.snapshot().contains("more"));
        assert!(!buf.snapshot().contains("0123456789"));
    }

    #[tokio::test]
    async fn scripted_worker_script_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = script(&tmp, "fake.sh", "#!/bin/sh\ncat\n");
        let mut worker = ProcessWorker::new(vec![path], 64 * 1024);
        worker.start().await.unwrap();
        let result = worker
            .execute(
                &Payload::Prompt {
                    prompt: "anything".to_string(),
                },
                Duration::from_secs(5),
            )
            .await;
        assert!(result.is_success());
    }
}
