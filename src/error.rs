use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Path traversal attempt: {0}")]
    PathTraversal(String),

    #[error("Path not allowed: {0}")]
    PathNotAllowed(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid working directory: {0}")]
    InvalidWorkdir(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Command execution error: {0}")]
    CommandExecutionError(String),

    #[error("Terminal session not found: {0}")]
    SessionNotFound(String),

    #[error("Terminal session terminated: {0}")]
    SessionTerminated(String),

    #[error("Maximum number of terminal sessions ({0}) reached. Close an existing terminal first.")]
    CapacityExceeded(usize),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

impl AppError {
    /// Errors caused by the caller's arguments rather than by the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::InvalidInputArgument(_)
                | AppError::InvalidWorkdir(_)
                | AppError::InvalidPath(_)
                | AppError::PathNotAllowed(_)
                | AppError::PathTraversal(_)
                | AppError::SessionNotFound(_)
                | AppError::UnknownTool(_)
        )
    }
}

impl From<AppError> for rust_mcp_schema::schema_utils::CallToolError {
    fn from(err: AppError) -> Self {
        if err.is_client_error() {
            tracing::debug!(error = %err, "Tool call rejected");
        } else {
            tracing::error!("AppError converted to CallToolError: {:?}", err);
        }
        match err {
            AppError::UnknownTool(name) => rust_mcp_schema::schema_utils::CallToolError::unknown_tool(name),
            other => rust_mcp_schema::schema_utils::CallToolError::new(other),
        }
    }
}
