use std::sync::Arc;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

use crate::create_timestamp;
use crate::judge::JudgeLoop;
use crate::language::LanguageRegistry;
use crate::sandbox::{Limits, SandboxRuntime};
use crate::scoring::score;
use crate::store::{JudgedSubmission, NewSubmission, ProblemStore, Submission, SubmissionStore};
use crate::verdict::{SubmissionStatus, TransitionError, Verdict};

/// Entry points of the judging core
///
/// The service owns no global state: the sandbox runtime and both stores are
/// injected, and a clone shares them.
#[derive(Clone)]
pub struct JudgeService {
    runtime: Arc<dyn SandboxRuntime>,
    languages: Arc<LanguageRegistry>,
    limits: Limits,
    problems: Arc<dyn ProblemStore>,
    submissions: Arc<dyn SubmissionStore>,
}

impl JudgeService {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        languages: Arc<LanguageRegistry>,
        limits: Limits,
        problems: Arc<dyn ProblemStore>,
        submissions: Arc<dyn SubmissionStore>,
    ) -> Self {
        Self {
            runtime,
            languages,
            limits,
            problems,
            submissions,
        }
    }

    /// Judges `code` against a problem's test cases without persisting anything
    pub async fn execute_code(&self, problem_id: i64, code: &str, language: &str) -> Verdict {
        self.judge(problem_id, code, language, &CancellationToken::new())
            .await
    }

    /// Judges a stored `PENDING` submission and records its terminal state
    ///
    /// A submission that already left `PENDING`, or that another judge loop
    /// has claimed, is rejected with a `TransitionError` and left untouched.
    /// Cancelled judging leaves the submission `PENDING` and unclaimed.
    pub async fn evaluate_submission(
        &self,
        submission_id: i64,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Submission> {
        let submission = self
            .submissions
            .submission(submission_id)
            .await?
            .ok_or_else(|| anyhow!("Submission {submission_id} not found"))?;
        if submission.status.is_terminal() {
            return Err(TransitionError::AlreadyResolved(submission.status).into());
        }
        if !self
            .submissions
            .claim_submission(submission_id, &create_timestamp())
            .await?
        {
            return Err(TransitionError::AlreadyClaimed.into());
        }

        let (submission, _) = self.evaluate_claimed(submission, cancel).await?;
        Ok(submission)
    }

    /// Stores a new submission and judges it right away
    pub async fn submit(
        &self,
        submission: NewSubmission,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(Submission, Verdict)> {
        let created = self
            .submissions
            .create_submission(&submission, &create_timestamp(), true)
            .await?;
        log::info!(
            "Submission {} created for problem {} in {}",
            created.id,
            created.problem_id,
            created.language
        );

        self.evaluate_claimed(created, cancel).await
    }

    /// Judges a submission this caller holds the claim on
    async fn evaluate_claimed(
        &self,
        submission: Submission,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(Submission, Verdict)> {
        let submission_id = submission.id;
        let (verdict, awarded) = match self.problems.problem(submission.problem_id).await {
            Ok(Some(problem)) => {
                let verdict = self
                    .judge(
                        problem.id,
                        &submission.code,
                        &submission.language,
                        cancel,
                    )
                    .await;
                let awarded = if verdict.is_accepted() {
                    score(problem.base_score, verdict.scoring_time_ms())
                } else {
                    0
                };
                (verdict, awarded)
            }
            Ok(None) => (
                Verdict::error(format!("Problem {} not found", submission.problem_id), 0, 0),
                0,
            ),
            Err(e) => {
                log::error!("Failed to load problem {}: {e:#}", submission.problem_id);
                (Verdict::error(format!("{e:#}"), 0, 0), 0)
            }
        };

        if cancel.is_cancelled() && verdict.status == SubmissionStatus::Error {
            self.release(submission_id).await;
            log::warn!("Judging of submission {submission_id} cancelled, left PENDING");
            let unchanged = self
                .submissions
                .submission(submission_id)
                .await?
                .unwrap_or(submission);
            return Ok((unchanged, verdict));
        }

        let judged = JudgedSubmission::from_verdict(&verdict, awarded, create_timestamp());
        let recorded = match self.submissions.record_verdict(submission_id, &judged).await {
            Ok(recorded) => recorded,
            Err(e) => {
                self.release(submission_id).await;
                return Err(e.context(format!(
                    "Failed to record verdict of submission {submission_id}"
                )));
            }
        };

        log::info!(
            "Submission {submission_id} judged {} ({}/{} passed, {} ms, score {awarded})",
            recorded.status,
            recorded.passed_test_cases,
            recorded.total_test_cases,
            verdict.execution_time_ms
        );
        Ok((recorded, verdict))
    }

    /// Hands a submission back to the pending scan
    async fn release(&self, submission_id: i64) {
        if let Err(e) = self.submissions.release_submission(submission_id).await {
            log::error!("Failed to release submission {submission_id}: {e:#}");
        }
    }

    async fn judge(
        &self,
        problem_id: i64,
        code: &str,
        language: &str,
        cancel: &CancellationToken,
    ) -> Verdict {
        let test_cases = match self.problems.test_cases_for_problem(problem_id).await {
            Ok(test_cases) => test_cases,
            Err(e) => {
                log::error!("{e:#}");
                return Verdict::error(format!("{e:#}"), 0, 0);
            }
        };

        JudgeLoop::new(self.runtime.as_ref(), &self.languages, &self.limits)
            .run(code, language, &test_cases, cancel)
            .await
    }
}
