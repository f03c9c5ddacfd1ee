// Test verdict printed on stdout as one JSON line

use jdwp_harness::process::{FAILED, PASSED, STATUS_BASE};
use jdwp_harness::{ExitStatus, FailureCategory, HarnessError};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    /// An assertion or error reply inside the test body
    TestFailure,
    /// The debuggee ran to completion with the wrong exit status
    DebuggeeFailure,
    Infrastructure,
}

#[derive(Debug, Serialize)]
pub struct Verdict {
    pub outcome: Outcome,
    pub debuggee_exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stderr: Vec<String>,
}

impl Verdict {
    pub fn from_result(result: &Result<ExitStatus, HarnessError>) -> Self {
        match result {
            Ok(status) => Self {
                outcome: Outcome::Passed,
                debuggee_exit_code: status.code,
                error: None,
                stderr: Vec::new(),
            },
            Err(e) => Self {
                outcome: match (e, e.category()) {
                    (HarnessError::UnexpectedExit { .. }, _) => Outcome::DebuggeeFailure,
                    (_, FailureCategory::TestFailure) => Outcome::TestFailure,
                    (_, FailureCategory::Infrastructure) => Outcome::Infrastructure,
                },
                debuggee_exit_code: e.exit_code(),
                error: Some(e.to_string()),
                stderr: e
                    .captured_output()
                    .map(|output| output.stderr.clone())
                    .unwrap_or_default(),
            },
        }
    }

    /// Status this runner exits with, in the debuggee's own convention.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Passed => STATUS_BASE + PASSED,
            _ => STATUS_BASE + FAILED,
        }
    }
}
