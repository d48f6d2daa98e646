use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiddError {
    #[error("workflow not found: run 'aidd init' in the workspace root")]
    NotInitialized,

    #[error("CLAUDE_PLUGIN_ROOT is required to run aidd tools")]
    PluginRootMissing,

    #[error("active ticket missing: pass --ticket or run set-active-feature")]
    ActiveTicketMissing,

    #[error("invalid ticket '{0}'")]
    InvalidTicket(String),

    #[error("invalid stage: {0}")]
    InvalidStage(String),

    #[error("invalid work item key '{0}': expected iteration_id=<id> or id=<value>")]
    InvalidWorkItemKey(String),

    #[error("scope '{0}' is locked by a concurrent invocation")]
    ScopeLocked(String),

    #[error("contract not found: {0}")]
    ContractMissing(String),

    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    #[error("unknown placeholder '{placeholder}' in template '{template}'")]
    UnknownPlaceholder { placeholder: String, template: String },

    #[error("path {path} escapes project root {root}")]
    PathEscapesRoot { path: String, root: String },

    #[error("{0}")]
    Validation(String),

    #[error("runner unavailable: {0}")]
    CommandUnavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AiddError>;
