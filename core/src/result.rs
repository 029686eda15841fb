use serde::{Deserialize, Serialize};
use std::fmt;

use crate::reporter::ReporterFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// The process could not be started.
    LaunchFailure,
    /// The process started but exited non-zero or was terminated abnormally.
    RuntimeFailure,
    /// A reporter could not be set up, so the tool was never launched.
    ReporterFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::LaunchFailure => "launch-failure",
            ErrorCode::RuntimeFailure => "runtime-failure",
            ErrorCode::ReporterFailure => "reporter-failure",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one tool invocation.
///
/// `success` is true only when the process started, terminated normally and
/// exited with status zero. Every failure carries a non-empty `error_message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub error_message: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reporter_faults: Vec<ReporterFault>,
}

impl LaunchResult {
    pub fn succeeded(duration: f64) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            signal: None,
            error_message: None,
            error_code: None,
            duration,
            reporter_faults: Vec::new(),
        }
    }

    pub fn launch_failure(message: impl Into<String>) -> Self {
        Self::failure(ErrorCode::LaunchFailure, None, None, message.into(), 0.0)
    }

    pub fn runtime_failure(
        exit_code: Option<i32>,
        signal: Option<i32>,
        message: impl Into<String>,
        duration: f64,
    ) -> Self {
        Self::failure(ErrorCode::RuntimeFailure, exit_code, signal, message.into(), duration)
    }

    pub fn reporter_failure(message: impl Into<String>) -> Self {
        Self::failure(ErrorCode::ReporterFailure, None, None, message.into(), 0.0)
    }

    fn failure(
        code: ErrorCode,
        exit_code: Option<i32>,
        signal: Option<i32>,
        mut message: String,
        duration: f64,
    ) -> Self {
        if message.trim().is_empty() {
            message = format!("Build failed ({})", code);
        }
        Self {
            success: false,
            exit_code,
            signal,
            error_message: Some(message),
            error_code: Some(code),
            duration,
            reporter_faults: Vec::new(),
        }
    }

    pub fn with_reporter_faults(mut self, faults: Vec<ReporterFault>) -> Self {
        self.reporter_faults = faults;
        self
    }

    /// Exit status a command-line wrapper should return for this result.
    pub fn process_exit_code(&self) -> i32 {
        if self.success {
            return 0;
        }
        match self.exit_code {
            Some(code) if code != 0 => code,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_always_carry_a_message() {
        let result = LaunchResult::runtime_failure(Some(2), None, "  ", 1.0);
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::RuntimeFailure));
        assert_eq!(
            result.error_message.as_deref(),
            Some("Build failed (runtime-failure)")
        );
    }

    #[test]
    fn test_launch_failure_has_no_exit_code() {
        let result = LaunchResult::launch_failure("No such file");
        assert_eq!(result.exit_code, None);
        assert_eq!(result.process_exit_code(), 1);
    }

    #[test]
    fn test_process_exit_code() {
        assert_eq!(LaunchResult::succeeded(0.1).process_exit_code(), 0);
        assert_eq!(
            LaunchResult::runtime_failure(Some(65), None, "failed", 0.1).process_exit_code(),
            65
        );
        assert_eq!(
            LaunchResult::runtime_failure(None, Some(9), "killed", 0.1).process_exit_code(),
            1
        );
    }
}
