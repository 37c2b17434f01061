use thiserror::Error;

#[derive(Debug, Error)]
pub enum TandemError {
    // Config errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Pipeline errors
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Step '{step}' failed: {message}")]
    StepFault { step: String, message: String },

    #[error("Step '{step}' timed out after {timeout_secs}s")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("Pipeline run aborted: {0}")]
    RunAborted(String),

    // Session errors
    #[error("Handshake with '{server}' timed out after {timeout_secs}s")]
    HandshakeTimeout { server: String, timeout_secs: u64 },

    #[error("Handshake with '{server}' failed: {message}")]
    Handshake { server: String, message: String },

    #[error("Session for '{0}' is closed")]
    SessionClosed(String),

    #[error("Teardown of {resource} failed: {message}")]
    Teardown { resource: String, message: String },

    // Tool provider errors
    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TandemError {
    /// Shorthand for a work-function fault raised inside a step.
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepFault {
            step: step.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TandemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = TandemError::HandshakeTimeout {
            server: "files".into(),
            timeout_secs: 60,
        };
        assert_eq!(e.to_string(), "Handshake with 'files' timed out after 60s");

        let e = TandemError::step("render", "font missing");
        assert_eq!(e.to_string(), "Step 'render' failed: font missing");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let e: TandemError = io.into();
        assert!(matches!(e, TandemError::Io(_)));
    }
}
