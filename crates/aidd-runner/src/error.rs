use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner command is empty")]
    EmptyCommand,

    #[error("failed to launch runner: {0}")]
    Launch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

impl RunnerError {
    /// Launcher-level reason code for classification upstream, e.g.
    /// `launcher_io_2` for a missing binary (ENOENT).
    pub fn reason_code(&self) -> String {
        match self {
            RunnerError::EmptyCommand => "command_unavailable".to_string(),
            RunnerError::Launch(_) => "launcher_io_unknown".to_string(),
            RunnerError::Io(err) => match err.raw_os_error() {
                Some(errno) => format!("launcher_io_{errno}"),
                None => "launcher_io_unknown".to_string(),
            },
        }
    }
}
