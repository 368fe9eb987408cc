use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::verdict::{SubmissionStatus, Verdict};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: i64,
    pub title: String,
    pub base_score: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: i64,
    pub problem_id: i64,
    pub input: String,
    pub expected_output: String,
    /// Hidden cases never reveal their expected output
    pub hidden: bool,
    pub order_index: i32,
}

/// A user's submission as accepted for judging
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewSubmission {
    pub user_id: i64,
    pub problem_id: i64,
    pub contest_id: Option<i64>,
    pub language: String,
    pub code: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: i64,
    pub user_id: i64,
    pub problem_id: i64,
    pub contest_id: Option<i64>,
    pub language: String,
    pub code: String,
    pub status: SubmissionStatus,
    pub execution_time_ms: Option<u64>,
    pub memory_used_kb: Option<u64>,
    pub score: u32,
    pub error_message: Option<String>,
    pub passed_test_cases: u32,
    pub total_test_cases: u32,
    pub submitted_at: String,
    pub judged_at: Option<String>,
    /// Set while one judge loop owns the submission
    pub claimed_at: Option<String>,
}

/// Everything the judging path writes back when it resolves a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgedSubmission {
    pub status: SubmissionStatus,
    pub execution_time_ms: u64,
    pub memory_used_kb: u64,
    pub score: u32,
    pub error_message: Option<String>,
    pub passed_test_cases: u32,
    pub total_test_cases: u32,
    pub judged_at: String,
}

impl JudgedSubmission {
    pub fn from_verdict(verdict: &Verdict, score: u32, judged_at: String) -> Self {
        Self {
            status: verdict.status,
            execution_time_ms: verdict.execution_time_ms,
            memory_used_kb: verdict.memory_used_kb,
            score,
            error_message: verdict.error_message.clone(),
            passed_test_cases: verdict.passed_test_cases,
            total_test_cases: verdict.total_test_cases,
            judged_at,
        }
    }
}

/// Read access to problems and their test cases
#[async_trait]
pub trait ProblemStore: Send + Sync {
    async fn problem(&self, id: i64) -> anyhow::Result<Option<Problem>>;

    /// Test cases of a problem in ascending order index; may be empty
    async fn test_cases_for_problem(&self, problem_id: i64) -> anyhow::Result<Vec<TestCase>>;
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Stores a new `PENDING` submission
    ///
    /// With `claimed` set the row is created already claimed by the caller,
    /// so no pending scan can pick it up before the caller judges it.
    async fn create_submission(
        &self,
        submission: &NewSubmission,
        submitted_at: &str,
        claimed: bool,
    ) -> anyhow::Result<Submission>;

    async fn submission(&self, id: i64) -> anyhow::Result<Option<Submission>>;

    /// Ids of the oldest unclaimed submissions still waiting for a verdict
    async fn pending_submissions(&self, limit: u32) -> anyhow::Result<Vec<i64>>;

    /// Claims a `PENDING` submission for one judge loop
    ///
    /// Returns `false` when the submission is resolved or already claimed.
    async fn claim_submission(&self, id: i64, claimed_at: &str) -> anyhow::Result<bool>;

    /// Gives up the claim on a still `PENDING` submission
    async fn release_submission(&self, id: i64) -> anyhow::Result<()>;

    /// Moves a `PENDING` submission to its terminal state
    ///
    /// Fails with a `TransitionError` when the submission was already
    /// resolved. The write is visible to subsequent reads once this returns.
    async fn record_verdict(
        &self,
        id: i64,
        judged: &JudgedSubmission,
    ) -> anyhow::Result<Submission>;
}
