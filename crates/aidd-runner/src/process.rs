//! Supervised execution of one runner invocation.
//!
//! Stdout and stderr are drained concurrently into bounded buffers; with a
//! `stream_base` the raw stdout is teed into `.stream.jsonl` and, for
//! JSON-lines runners, a rendered transcript into `.stream.log`. On
//! Ctrl-C the child gets a grace period to exit before it is killed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{Result, RunnerError};
use crate::stream::{render_line, RenderState};
use crate::types::{LaunchResult, OutputLimits, RunnerSpec, StreamMode};

#[derive(Debug, Default)]
struct Capture {
    text: String,
    lines: usize,
    limited: bool,
}

impl Capture {
    fn push_line(&mut self, line: &str, limits: &OutputLimits) {
        self.lines += 1;
        if self.limited
            || self.lines > limits.max_lines
            || self.text.len() + line.len() + 1 > limits.max_bytes
        {
            self.limited = true;
            return;
        }
        self.text.push_str(line);
        self.text.push('\n');
    }
}

struct StreamTee {
    jsonl: Option<tokio::fs::File>,
    log: Option<tokio::fs::File>,
    render: bool,
    state: RenderState,
}

impl StreamTee {
    async fn open(spec: &RunnerSpec) -> Result<(Self, Option<PathBuf>, Option<PathBuf>)> {
        let Some(base) = &spec.stream_base else {
            return Ok((
                Self { jsonl: None, log: None, render: false, state: RenderState::new() },
                None,
                None,
            ));
        };
        if let Some(parent) = base.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let render = spec.stream == StreamMode::JsonLines;
        let jsonl_path = render.then(|| with_suffix(base, ".stream.jsonl"));
        let log_path = with_suffix(base, ".stream.log");
        let jsonl = match &jsonl_path {
            Some(path) => Some(tokio::fs::File::create(path).await?),
            None => None,
        };
        let log = Some(tokio::fs::File::create(&log_path).await?);
        Ok((
            Self { jsonl, log, render, state: RenderState::new() },
            jsonl_path,
            Some(log_path),
        ))
    }

    async fn write_line(&mut self, line: &str) {
        if let Some(file) = self.jsonl.as_mut() {
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
        if let Some(file) = self.log.as_mut() {
            if self.render {
                let mut rendered = String::new();
                if render_line(line, &mut rendered, &mut self.state) {
                    let _ = file.write_all(rendered.as_bytes()).await;
                } else {
                    let _ = file.write_all(line.as_bytes()).await;
                    let _ = file.write_all(b"\n").await;
                }
            } else {
                let _ = file.write_all(line.as_bytes()).await;
                let _ = file.write_all(b"\n").await;
            }
        }
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    name.push_str(suffix);
    base.with_file_name(name)
}

fn drain_reader<R: AsyncRead + Unpin + Send + 'static>(
    reader: R,
    limits: OutputLimits,
    tee: Option<Arc<Mutex<StreamTee>>>,
) -> tokio::task::JoinHandle<Capture> {
    tokio::spawn(async move {
        let mut capture = Capture::default();
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            capture.push_line(&line, &limits);
            if let Some(tee) = &tee {
                tee.lock().await.write_line(&line).await;
            }
        }
        capture
    })
}

/// Launch the runner and supervise it to completion. Launcher-level I/O
/// failures are reported inside the `LaunchResult`, with the reason code
/// mirrored as a `reason_code=…` marker in the stderr capture.
pub async fn launch(spec: &RunnerSpec) -> Result<LaunchResult> {
    let (program, args) = spec.command.split_first().ok_or(RunnerError::EmptyCommand)?;

    let (tee, jsonl_path, log_path) = StreamTee::open(spec).await?;
    let tee = spec.stream_base.is_some().then(|| Arc::new(Mutex::new(tee)));

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            let launcher = RunnerError::Io(err);
            let reason = launcher.reason_code();
            tracing::error!(reason_code = %reason, "runner spawn failed");
            return Ok(LaunchResult {
                exit_code: -1,
                stderr: format!("reason_code={reason}\n"),
                launcher_error_reason: reason,
                stream_jsonl_path: jsonl_path,
                stream_log_path: log_path,
                ..Default::default()
            });
        }
    };

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let stdout_task = drain_reader(stdout, spec.limits, tee.clone());
    let stderr_task = drain_reader(stderr, spec.limits, None);

    let mut killed = false;
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(grace_secs = spec.grace.as_secs(), "interrupt received, waiting for runner");
            match tokio::time::timeout(spec.grace, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    killed = true;
                    child.kill().await?;
                    child.wait().await?
                }
            }
        }
    };

    let stdout_capture = stdout_task.await.unwrap_or_default();
    let stderr_capture = stderr_task.await.unwrap_or_default();

    Ok(LaunchResult {
        exit_code: status.code().unwrap_or(-1),
        stdout: stdout_capture.text,
        stderr: stderr_capture.text,
        output_limited: stdout_capture.limited || stderr_capture.limited,
        launcher_error_reason: String::new(),
        killed,
        stream_jsonl_path: jsonl_path,
        stream_log_path: log_path,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shell_spec(dir: &Path, script: &str) -> RunnerSpec {
        RunnerSpec::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            dir.to_path_buf(),
        )
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let spec = shell_spec(dir.path(), "echo out; echo err >&2; exit 3");
        let result = launch(&spec).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(!result.output_limited);
        assert!(result.launcher_error_reason.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_reports_launcher_reason() {
        let dir = TempDir::new().unwrap();
        let spec = RunnerSpec::new(
            vec!["definitely-not-a-real-runner".to_string()],
            dir.path().to_path_buf(),
        );
        let result = launch(&spec).await.unwrap();
        assert!(result.launcher_error_reason.starts_with("launcher_io_"));
        assert!(result.stderr.contains("reason_code=launcher_io_"));
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn bounded_output_sets_limited_flag() {
        let dir = TempDir::new().unwrap();
        let mut spec = shell_spec(dir.path(), "for i in $(seq 1 100); do echo line$i; done");
        spec.limits = OutputLimits { max_bytes: 1024, max_lines: 10 };
        let result = launch(&spec).await.unwrap();
        assert!(result.output_limited);
        assert_eq!(result.stdout.lines().count(), 10);
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn jsonl_stream_is_teed_and_rendered() {
        let dir = TempDir::new().unwrap();
        let mut spec = shell_spec(
            dir.path(),
            r#"echo '{"type":"text","text":"hello\n"}'; echo '{"type":"tool_use","name":"bash"}'"#,
        );
        spec.stream = StreamMode::JsonLines;
        spec.stream_base = Some(dir.path().join("logs/stage.implement"));
        let result = launch(&spec).await.unwrap();
        let jsonl = std::fs::read_to_string(result.stream_jsonl_path.unwrap()).unwrap();
        assert_eq!(jsonl.lines().count(), 2);
        let log = std::fs::read_to_string(result.stream_log_path.unwrap()).unwrap();
        assert!(log.contains("hello"));
        assert!(log.contains("[tool:start] bash"));
    }
}
