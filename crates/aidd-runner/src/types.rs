use std::path::PathBuf;

/// How to interpret the runner's stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Plain text, passed through as-is.
    #[default]
    Text,
    /// JSON-lines event stream: raw lines are kept in `.stream.jsonl`,
    /// a rendered transcript goes to `.stream.log`.
    JsonLines,
}

/// Bounded-output policy for the captured stdout/stderr buffers.
#[derive(Debug, Clone, Copy)]
pub struct OutputLimits {
    pub max_bytes: usize,
    pub max_lines: usize,
}

impl Default for OutputLimits {
    fn default() -> Self {
        Self { max_bytes: 4 * 1024 * 1024, max_lines: 20_000 }
    }
}

/// One runner invocation: the command line, its environment, and where to
/// tee the stream artifacts.
#[derive(Debug, Clone)]
pub struct RunnerSpec {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub stream: StreamMode,
    pub limits: OutputLimits,
    /// Base path for stream artifacts; `.stream.jsonl` / `.stream.log`
    /// suffixes are appended. `None` disables the tee.
    pub stream_base: Option<PathBuf>,
    /// Grace period before SIGKILL when cancellation is requested.
    pub grace: std::time::Duration,
}

impl RunnerSpec {
    pub fn new(command: Vec<String>, cwd: PathBuf) -> Self {
        Self {
            command,
            cwd,
            env: Vec::new(),
            stream: StreamMode::default(),
            limits: OutputLimits::default(),
            stream_base: None,
            grace: std::time::Duration::from_secs(5),
        }
    }
}

/// Outcome of one supervised run. `stdout`/`stderr` hold the bounded
/// captures even when the child failed to exit cleanly.
#[derive(Debug, Default)]
pub struct LaunchResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// True when either capture hit the bounded-output policy.
    pub output_limited: bool,
    /// Set when the failure happened in the launcher rather than the
    /// runner, e.g. `launcher_io_2` when the binary does not exist.
    pub launcher_error_reason: String,
    pub killed: bool,
    pub stream_jsonl_path: Option<PathBuf>,
    pub stream_log_path: Option<PathBuf>,
}

impl LaunchResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.launcher_error_reason.is_empty()
    }
}
