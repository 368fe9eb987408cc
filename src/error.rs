use thiserror::Error;

/// Failures raised by the sandbox layer before or while running a submission.
///
/// These are not verdicts: the judge loop converts every one of them into an
/// `ERROR` verdict carrying the message.
#[derive(Debug, Error)]
pub enum JudgeError {
    /// The submission's language tag has no runtime template.
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// The sandbox backend could not be reached or refused to start.
    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// Unexpected I/O failure while preparing or executing.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl JudgeError {
    /// Configuration errors are rejected before any sandbox resource exists
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnsupportedLanguage(_))
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Attaches sandbox context to raw I/O results
pub trait IoContext<T> {
    fn sandbox_context(self, context: impl FnOnce() -> String) -> Result<T, JudgeError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn sandbox_context(self, context: impl FnOnce() -> String) -> Result<T, JudgeError> {
        self.map_err(|e| JudgeError::io(context(), e))
    }
}
