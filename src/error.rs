use thiserror::Error;

/// Main error type for the toolkit
#[derive(Error, Debug)]
pub enum ToolkitError {
    #[error("Resolution error: {0}")]
    Resolve(ResolveError),

    #[error("Command error: {0}")]
    Command(CommandError),

    #[error("Session error: {0}")]
    Session(SessionError),

    #[error("AWS error: {0}")]
    Aws(AwsError),

    #[error("Invalid argument: {0}")]
    Usage(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("TOML error: {0}")]
    Toml(String),

    #[error("Error: {0}")]
    Anyhow(String),
}

/// Instance resolution errors
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no instance found for '{target}'")]
    NotFound { target: String },

    #[error(
        "found {} instances for '{}': {}; pass the instance ID directly to pick one",
        candidates.len(),
        target,
        candidates.join(" ")
    )]
    Ambiguous {
        target: String,
        candidates: Vec<String>,
    },
}

/// Remote command execution errors
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("command {command_id} failed on {instance_id}")]
    Failed {
        command_id: String,
        instance_id: String,
    },

    #[error("command {command_id} did not finish within {waited_secs}s")]
    TimedOut {
        command_id: String,
        waited_secs: u64,
    },

    #[error("no output recorded for command {command_id} on {instance_id}")]
    MissingOutput {
        command_id: String,
        instance_id: String,
    },
}

/// Session and local process errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("cannot use privileged local port {port} (choose a port >= 1024)")]
    PrivilegedPort { port: u16 },

    #[error("local port {port} is not available; try a different port")]
    PortUnavailable { port: u16 },

    #[error("failed to start '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("session process exited with status {code}")]
    SessionExited { code: i32 },

    #[error("failed to create run-as user '{user}' on {instance_id}")]
    RunAsUserFailed { user: String, instance_id: String },

    #[error("failed to create tunnel user '{user}' on {instance_id}")]
    TunnelUserFailed { user: String, instance_id: String },

    #[error("could not determine home directory")]
    HomeDirUnavailable,
}

/// AWS service errors
#[derive(Error, Debug)]
pub enum AwsError {
    #[error("{operation} failed: {message}")]
    ServiceError { operation: String, message: String },

    #[error("caller identity has no ARN")]
    MissingIdentity,

    #[error("send-command response carried no command ID")]
    MissingCommandId,
}

impl AwsError {
    pub fn service(operation: &str, err: impl std::fmt::Display) -> Self {
        AwsError::ServiceError {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for toolkit operations
pub type Result<T> = std::result::Result<T, ToolkitError>;

// From trait implementations for error conversion
impl From<ResolveError> for ToolkitError {
    fn from(err: ResolveError) -> Self {
        ToolkitError::Resolve(err)
    }
}

impl From<CommandError> for ToolkitError {
    fn from(err: CommandError) -> Self {
        ToolkitError::Command(err)
    }
}

impl From<SessionError> for ToolkitError {
    fn from(err: SessionError) -> Self {
        ToolkitError::Session(err)
    }
}

impl From<AwsError> for ToolkitError {
    fn from(err: AwsError) -> Self {
        ToolkitError::Aws(err)
    }
}

impl From<std::io::Error> for ToolkitError {
    fn from(err: std::io::Error) -> Self {
        ToolkitError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ToolkitError {
    fn from(err: serde_json::Error) -> Self {
        ToolkitError::Json(err.to_string())
    }
}

impl From<toml::de::Error> for ToolkitError {
    fn from(err: toml::de::Error) -> Self {
        ToolkitError::Toml(err.to_string())
    }
}

impl From<anyhow::Error> for ToolkitError {
    fn from(err: anyhow::Error) -> Self {
        ToolkitError::Anyhow(err.to_string())
    }
}
