use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a submission
///
/// `Pending` is the only non-terminal state. Every judging attempt moves a
/// submission out of it exactly once.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Pending,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompilationError,
    Error,
}

impl SubmissionStatus {
    pub const TERMINAL: [SubmissionStatus; 7] = [
        Self::Accepted,
        Self::WrongAnswer,
        Self::TimeLimitExceeded,
        Self::MemoryLimitExceeded,
        Self::RuntimeError,
        Self::CompilationError,
        Self::Error,
    ];

    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::WrongAnswer => "WRONG_ANSWER",
            Self::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            Self::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",
            Self::RuntimeError => "RUNTIME_ERROR",
            Self::CompilationError => "COMPILATION_ERROR",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown submission status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for SubmissionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(' ', "_");
        std::iter::once(Self::Pending)
            .chain(Self::TERMINAL)
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("submission already resolved to {0}")]
    AlreadyResolved(SubmissionStatus),
    #[error("cannot resolve a submission back to PENDING")]
    NotTerminal,
    #[error("submission is already being judged")]
    AlreadyClaimed,
}

/// One-shot state machine guarding a submission's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerdictState {
    status: SubmissionStatus,
}

impl VerdictState {
    pub fn pending() -> Self {
        Self {
            status: SubmissionStatus::Pending,
        }
    }

    /// Rehydrates a state read back from storage
    pub fn from_status(status: SubmissionStatus) -> Self {
        Self { status }
    }

    pub fn status(&self) -> SubmissionStatus {
        self.status
    }

    /// Moves `PENDING` to `terminal`; fails on any other transition
    pub fn resolve(&mut self, terminal: SubmissionStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyResolved(self.status));
        }
        if !terminal.is_terminal() {
            return Err(TransitionError::NotTerminal);
        }
        self.status = terminal;
        Ok(())
    }
}

impl Default for VerdictState {
    fn default() -> Self {
        Self::pending()
    }
}

/// Aggregate result of judging one submission against its test cases
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub status: SubmissionStatus,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
    pub memory_used_kb: u64,
    pub passed_test_cases: u32,
    pub total_test_cases: u32,
}

impl Verdict {
    /// An `ERROR` verdict that never reached a passing run
    pub fn error(message: impl Into<String>, passed: u32, total: u32) -> Self {
        Self {
            status: SubmissionStatus::Error,
            output: None,
            error_message: Some(message.into()),
            execution_time_ms: 0,
            memory_used_kb: 0,
            passed_test_cases: passed,
            total_test_cases: total,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == SubmissionStatus::Accepted
    }

    /// Execution time fed to scoring, known only for accepted runs
    pub fn scoring_time_ms(&self) -> Option<u64> {
        self.is_accepted().then_some(self.execution_time_ms)
    }
}
