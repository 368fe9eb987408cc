use tokio_util::sync::CancellationToken;

use crate::comparator::outputs_match;
use crate::error::JudgeError;
use crate::language::{LanguageRegistry, LanguageTemplate};
use crate::sandbox::{ExecutionOutcome, Limits, OutcomeStatus, SandboxRuntime};
use crate::store::TestCase;
use crate::verdict::{SubmissionStatus, Verdict};

pub const NO_TEST_CASES_MESSAGE: &str = "No test cases found for this problem";
pub const ACCEPTED_OUTPUT: &str = "All test cases passed";
pub const CANCELLED_MESSAGE: &str = "judging cancelled";

/// Runs one submission against an ordered set of test cases
///
/// The loop stops at the first test case that does not pass and reports that
/// case's outcome. Sandbox failures never escape: they become `ERROR`
/// verdicts carrying the diagnostic and the number of cases passed so far.
pub struct JudgeLoop<'a> {
    runtime: &'a dyn SandboxRuntime,
    languages: &'a LanguageRegistry,
    limits: &'a Limits,
}

/// Running totals over the passed test cases
#[derive(Debug, Default)]
struct Progress {
    passed: u32,
    total_time_ms: u64,
    peak_memory_kb: u64,
}

impl<'a> JudgeLoop<'a> {
    pub fn new(
        runtime: &'a dyn SandboxRuntime,
        languages: &'a LanguageRegistry,
        limits: &'a Limits,
    ) -> Self {
        Self {
            runtime,
            languages,
            limits,
        }
    }

    pub async fn run(
        &self,
        code: &str,
        language_tag: &str,
        test_cases: &[TestCase],
        cancel: &CancellationToken,
    ) -> Verdict {
        if test_cases.is_empty() {
            return Verdict::error(NO_TEST_CASES_MESSAGE, 0, 0);
        }
        let total = test_cases.len() as u32;

        let language = match self.languages.resolve(language_tag) {
            Ok(language) => language,
            Err(e) => return Verdict::error(e.to_string(), 0, total),
        };

        let mut ordered: Vec<&TestCase> = test_cases.iter().collect();
        ordered.sort_by_key(|case| case.order_index);

        let mut progress = Progress::default();
        for (position, case) in ordered.into_iter().enumerate() {
            if cancel.is_cancelled() {
                log::info!("Judging cancelled after {} passed cases", progress.passed);
                return Verdict::error(CANCELLED_MESSAGE, progress.passed, total);
            }

            let outcome = match self.run_case(code, &language, case).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("Sandbox failure on test case {}: {e}", position + 1);
                    return Verdict::error(e.to_string(), progress.passed, total);
                }
            };
            log::debug!(
                "Test case {} finished as {:?} in {} ms",
                position + 1,
                outcome.status,
                outcome.duration_ms()
            );

            let duration_ms = outcome.duration_ms();
            progress.peak_memory_kb = progress.peak_memory_kb.max(outcome.memory_kb);
            if let Some(verdict) = failure_verdict(outcome, case, position + 1) {
                return Verdict {
                    memory_used_kb: progress.peak_memory_kb,
                    passed_test_cases: progress.passed,
                    total_test_cases: total,
                    ..verdict
                };
            }

            progress.passed += 1;
            progress.total_time_ms += duration_ms;
        }

        Verdict {
            status: SubmissionStatus::Accepted,
            output: Some(ACCEPTED_OUTPUT.to_string()),
            error_message: None,
            execution_time_ms: progress.total_time_ms,
            memory_used_kb: progress.peak_memory_kb,
            passed_test_cases: progress.passed,
            total_test_cases: total,
        }
    }

    async fn run_case(
        &self,
        code: &str,
        language: &LanguageTemplate,
        case: &TestCase,
    ) -> Result<ExecutionOutcome, JudgeError> {
        let workspace = self.runtime.prepare(code, language).await?;
        self.runtime
            .execute(workspace, &case.input, self.limits)
            .await
    }
}

/// Turns a non-passing outcome into the verdict that ends the loop
///
/// `position` is the 1-based place of the case in judging order. Returns
/// `None` when the case passed.
fn failure_verdict(
    outcome: ExecutionOutcome,
    case: &TestCase,
    position: usize,
) -> Option<Verdict> {
    let duration_ms = outcome.duration_ms();
    let (status, error_message) = match outcome.status {
        OutcomeStatus::Exited if outputs_match(&outcome.stdout, &case.expected_output) => {
            return None;
        }
        OutcomeStatus::Exited => {
            let message = if case.hidden {
                format!("Wrong answer on test case {position}")
            } else {
                format!(
                    "Wrong answer on test case {position}. Expected: {}",
                    case.expected_output
                )
            };
            (SubmissionStatus::WrongAnswer, Some(message))
        }
        OutcomeStatus::RuntimeError => {
            let mut message = outcome.message.unwrap_or_else(|| "Runtime error".to_string());
            let stderr = outcome.stderr.trim();
            if !stderr.is_empty() {
                message.push('\n');
                message.push_str(stderr);
            }
            (SubmissionStatus::RuntimeError, Some(message))
        }
        OutcomeStatus::TimeLimitExceeded => {
            (SubmissionStatus::TimeLimitExceeded, outcome.message)
        }
        OutcomeStatus::MemoryLimitExceeded => {
            (SubmissionStatus::MemoryLimitExceeded, outcome.message)
        }
        OutcomeStatus::CompilationError => {
            (SubmissionStatus::CompilationError, outcome.message)
        }
    };

    Some(Verdict {
        status,
        output: Some(outcome.stdout),
        error_message,
        execution_time_ms: duration_ms,
        memory_used_kb: outcome.memory_kb,
        passed_test_cases: 0,
        total_test_cases: 0,
    })
}
