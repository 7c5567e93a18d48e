//! Errors a tool service may report back to the dispatcher

use thiserror::Error;

/// Failure of a single tool or resource operation.
///
/// The dispatcher turns every variant into a JSON-RPC internal error that
/// carries the message, so the wording here is what remote clients see.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0} not supported")]
    Unsupported(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            ToolError::NotFound("read_file".into()).to_string(),
            "Unknown tool: read_file"
        );
        assert_eq!(
            ToolError::Unsupported("Resources".into()).to_string(),
            "Resources not supported"
        );
        assert_eq!(ToolError::failed("boom").to_string(), "boom");
    }

    #[test]
    fn test_from_anyhow_is_transparent() {
        let err: ToolError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.to_string(), "disk on fire");
    }
}
