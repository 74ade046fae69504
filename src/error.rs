use std::fmt;

use serde::{Deserialize, Serialize};

use crate::vm::TerminationReason;

/// Phase of the job pipeline a timeout fired in
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Query,
    Compilation,
    Execution,
    VmLaunch,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Query => "query",
            Self::Compilation => "compilation",
            Self::Execution => "execution",
            Self::VmLaunch => "vm launch",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The guest toolchain rejected the user's sources
    Compilation,
    Timeout(Phase),
    InvalidArgument,
    /// Admission control denied the request before anything was committed
    ClusterOverloaded,
    /// The control channel to a VM broke mid-conversation
    ChannelRead,
    /// The VM did the work but its output could not be retrieved
    OutputNotFound,
    Cancelled,
    Internal,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.error_code())
    }
}

impl Reason {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Compilation => "COMPILATION_ERROR",
            Self::Timeout(Phase::Compilation | Phase::Execution) => "EXECUTION_TIMEOUT",
            Self::Timeout(Phase::Query | Phase::VmLaunch) => "TIMEOUT",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::ClusterOverloaded => "SERVICE_OVERLOADED",
            Self::ChannelRead => "SERVICE_UNAVAILABLE",
            Self::OutputNotFound => "EXECUTION_ERROR",
            Self::Cancelled => "REQUEST_CANCELLED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Compilation | Self::InvalidArgument => 400,
            Self::Timeout(Phase::Compilation | Phase::Execution) => 408,
            Self::Timeout(Phase::Query | Phase::VmLaunch) => 504,
            Self::ClusterOverloaded | Self::ChannelRead | Self::Cancelled => 503,
            Self::OutputNotFound | Self::Internal => 500,
        }
    }
}

/// The single failure type of the job path; every await boundary returns it
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct JobError {
    pub reason: Reason,
    pub message: String,
}

impl JobError {
    pub fn new(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn compilation(diagnostics: impl Into<String>) -> Self {
        Self::new(Reason::Compilation, diagnostics)
    }

    pub fn timeout(phase: Phase, after: std::time::Duration) -> Self {
        Self::new(
            Reason::Timeout(phase),
            format!("{phase} timed out after {}ms", after.as_millis()),
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Reason::InvalidArgument, message)
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(Reason::ClusterOverloaded, message)
    }

    pub fn channel_read(message: impl Into<String>) -> Self {
        Self::new(Reason::ChannelRead, message)
    }

    pub fn output_not_found(message: impl Into<String>) -> Self {
        Self::new(Reason::OutputNotFound, message)
    }

    pub fn cancelled() -> Self {
        Self::new(Reason::Cancelled, "request cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Reason::Internal, message)
    }

    pub fn error_code(&self) -> &'static str {
        self.reason.error_code()
    }

    pub fn status_code(&self) -> u16 {
        self.reason.status_code()
    }

    /// Why the VM that produced this error must be torn down, if at all.
    /// User compile errors leave the VM healthy; overload never touched one.
    pub fn teardown_reason(&self) -> Option<TerminationReason> {
        match self.reason {
            Reason::Compilation | Reason::InvalidArgument | Reason::ClusterOverloaded => None,
            Reason::Cancelled => Some(TerminationReason::Orphaned),
            Reason::Timeout(_)
            | Reason::ChannelRead
            | Reason::OutputNotFound
            | Reason::Internal => Some(TerminationReason::Error),
        }
    }

    /// Cancellation and user mistakes are expected traffic, not faults
    pub fn is_fault(&self) -> bool {
        !matches!(
            self.reason,
            Reason::Cancelled | Reason::Compilation | Reason::InvalidArgument
        )
    }

    /// Text safe to show to the person who submitted the code
    pub fn user_message(&self) -> String {
        match self.reason {
            Reason::Compilation | Reason::InvalidArgument => self.message.clone(),
            Reason::Timeout(Phase::Execution) => {
                "Execution timed out. Your code may have an infinite loop.".to_string()
            }
            Reason::Timeout(_) => "The request timed out. Please try again later.".to_string(),
            Reason::ClusterOverloaded => {
                "Service is busy. Please try again in a moment.".to_string()
            }
            Reason::ChannelRead => {
                "The service you tried to use is temporarily unavailable, please try again later"
                    .to_string()
            }
            Reason::OutputNotFound => {
                "Something went wrong during code execution. Please try again later".to_string()
            }
            Reason::Cancelled => "The request was cancelled.".to_string(),
            Reason::Internal => "An unexpected error occurred during execution.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocabulary_and_status_codes() {
        let cases = [
            (JobError::compilation("x"), "COMPILATION_ERROR", 400),
            (
                JobError::new(Reason::Timeout(Phase::Execution), "x"),
                "EXECUTION_TIMEOUT",
                408,
            ),
            (JobError::new(Reason::Timeout(Phase::VmLaunch), "x"), "TIMEOUT", 504),
            (JobError::invalid_argument("x"), "INVALID_ARGUMENT", 400),
            (JobError::overloaded("x"), "SERVICE_OVERLOADED", 503),
            (JobError::channel_read("x"), "SERVICE_UNAVAILABLE", 503),
            (JobError::output_not_found("x"), "EXECUTION_ERROR", 500),
            (JobError::cancelled(), "REQUEST_CANCELLED", 503),
            (JobError::internal("x"), "INTERNAL_ERROR", 500),
        ];

        for (err, code, status) in cases {
            assert_eq!(err.error_code(), code);
            assert_eq!(err.status_code(), status);
        }
    }

    #[test]
    fn test_compilation_error_keeps_vm() {
        assert_eq!(JobError::compilation("bad").teardown_reason(), None);
        assert_eq!(JobError::overloaded("full").teardown_reason(), None);
        assert_eq!(
            JobError::channel_read("eof").teardown_reason(),
            Some(TerminationReason::Error)
        );
        assert_eq!(
            JobError::cancelled().teardown_reason(),
            Some(TerminationReason::Orphaned)
        );
    }

    #[test]
    fn test_cancellation_is_not_a_fault() {
        assert!(!JobError::cancelled().is_fault());
        assert!(JobError::output_not_found("gone").is_fault());
    }
}
