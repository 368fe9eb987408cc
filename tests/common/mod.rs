#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use sandjudge::config::LanguageConfig;
use sandjudge::error::JudgeError;
use sandjudge::language::{LanguageRegistry, LanguageTemplate};
use sandjudge::sandbox::{ExecutionOutcome, Limits, OutcomeStatus, SandboxRuntime, Workspace};
use sandjudge::store::{
    JudgedSubmission, NewSubmission, Problem, ProblemStore, Submission, SubmissionStore, TestCase,
};
use sandjudge::verdict::{SubmissionStatus, VerdictState};

type Script = Box<dyn Fn(&str, &str) -> Result<ExecutionOutcome, JudgeError> + Send + Sync>;

/// Sandbox runtime that answers from a script instead of running anything
///
/// The script receives the submitted code and the test case input. Real
/// workspaces are created so cleanup can be observed.
pub struct FakeRuntime {
    root: TempDir,
    script: Script,
    prepared: AtomicUsize,
    inputs: Mutex<Vec<String>>,
    delay: Duration,
}

impl FakeRuntime {
    pub fn new(
        script: impl Fn(&str, &str) -> Result<ExecutionOutcome, JudgeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            script: Box::new(script),
            prepared: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Makes every execution take `delay` of real time
    pub fn delayed(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    /// Prints the code itself, as if the submission were `cat`-like
    pub fn echo_code(duration_ms: u64) -> Self {
        Self::new(move |code, _| Ok(exited(code, duration_ms)))
    }

    pub fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    /// Inputs of every executed test case, in execution order
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }

    pub fn live_workspaces(&self) -> usize {
        std::fs::read_dir(self.root.path()).unwrap().count()
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn prepare(
        &self,
        code: &str,
        language: &LanguageTemplate,
    ) -> Result<Workspace, JudgeError> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        Workspace::create(self.root.path(), language, code)
    }

    async fn execute(
        &self,
        workspace: Workspace,
        input: &str,
        _limits: &Limits,
    ) -> Result<ExecutionOutcome, JudgeError> {
        self.inputs.lock().push(input.to_string());
        tokio::time::sleep(self.delay).await;
        let code = std::fs::read_to_string(workspace.source_path()).unwrap();
        (self.script)(code.trim_end_matches('\n'), input)
    }
}

pub fn outcome(status: OutcomeStatus, stdout: &str, duration_ms: u64) -> ExecutionOutcome {
    ExecutionOutcome {
        status,
        stdout: stdout.to_string(),
        stderr: String::new(),
        duration: Duration::from_millis(duration_ms),
        exit_code: None,
        memory_kb: 0,
        message: None,
    }
}

pub fn exited(stdout: &str, duration_ms: u64) -> ExecutionOutcome {
    ExecutionOutcome {
        exit_code: Some(0),
        ..outcome(OutcomeStatus::Exited, stdout, duration_ms)
    }
}

pub fn test_case(id: i64, order_index: i32, input: &str, expected_output: &str) -> TestCase {
    TestCase {
        id,
        problem_id: 1,
        input: input.to_string(),
        expected_output: expected_output.to_string(),
        hidden: false,
        order_index,
    }
}

pub fn sh_language() -> LanguageConfig {
    LanguageConfig {
        name: "SH".to_string(),
        file_name: "main.sh".to_string(),
        compile: None,
        run: vec!["/bin/sh".to_string(), "%INPUT%".to_string()],
        limit_address_space: true,
    }
}

pub fn registry() -> LanguageRegistry {
    let mut languages = sandjudge::config::default_languages();
    languages.push(sh_language());
    LanguageRegistry::new(languages)
}

pub fn sh_template() -> LanguageTemplate {
    LanguageTemplate::from(sh_language())
}

/// In-memory problem and submission store
#[derive(Default)]
pub struct MemoryStore {
    problems: Mutex<HashMap<i64, Problem>>,
    test_cases: Mutex<HashMap<i64, Vec<TestCase>>>,
    submissions: Mutex<Vec<Submission>>,
    fail_test_case_reads: AtomicBool,
    fail_verdict_writes: AtomicBool,
}

impl MemoryStore {
    pub fn with_problem(problem: Problem, test_cases: Vec<TestCase>) -> Self {
        let store = Self::default();
        store.test_cases.lock().insert(problem.id, test_cases);
        store.problems.lock().insert(problem.id, problem);
        store
    }

    pub fn fail_test_case_reads(&self) {
        self.fail_test_case_reads.store(true, Ordering::SeqCst);
    }

    pub fn fail_verdict_writes(&self, fail: bool) {
        self.fail_verdict_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProblemStore for MemoryStore {
    async fn problem(&self, id: i64) -> anyhow::Result<Option<Problem>> {
        Ok(self.problems.lock().get(&id).cloned())
    }

    async fn test_cases_for_problem(&self, problem_id: i64) -> anyhow::Result<Vec<TestCase>> {
        if self.fail_test_case_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("test case storage offline"));
        }
        let mut cases = self
            .test_cases
            .lock()
            .get(&problem_id)
            .cloned()
            .unwrap_or_default();
        cases.sort_by_key(|case| case.order_index);
        Ok(cases)
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn create_submission(
        &self,
        submission: &NewSubmission,
        submitted_at: &str,
        claimed: bool,
    ) -> anyhow::Result<Submission> {
        let mut submissions = self.submissions.lock();
        let created = Submission {
            id: submissions.len() as i64 + 1,
            user_id: submission.user_id,
            problem_id: submission.problem_id,
            contest_id: submission.contest_id,
            language: submission.language.clone(),
            code: submission.code.clone(),
            status: SubmissionStatus::Pending,
            execution_time_ms: None,
            memory_used_kb: None,
            score: 0,
            error_message: None,
            passed_test_cases: 0,
            total_test_cases: 0,
            submitted_at: submitted_at.to_string(),
            judged_at: None,
            claimed_at: claimed.then(|| submitted_at.to_string()),
        };
        submissions.push(created.clone());
        Ok(created)
    }

    async fn submission(&self, id: i64) -> anyhow::Result<Option<Submission>> {
        Ok(self.submissions.lock().iter().find(|s| s.id == id).cloned())
    }

    async fn pending_submissions(&self, limit: u32) -> anyhow::Result<Vec<i64>> {
        Ok(self
            .submissions
            .lock()
            .iter()
            .filter(|s| s.status == SubmissionStatus::Pending && s.claimed_at.is_none())
            .take(limit as usize)
            .map(|s| s.id)
            .collect())
    }

    async fn claim_submission(&self, id: i64, claimed_at: &str) -> anyhow::Result<bool> {
        let mut submissions = self.submissions.lock();
        match submissions.iter_mut().find(|s| s.id == id) {
            Some(s) if s.status == SubmissionStatus::Pending && s.claimed_at.is_none() => {
                s.claimed_at = Some(claimed_at.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_submission(&self, id: i64) -> anyhow::Result<()> {
        let mut submissions = self.submissions.lock();
        if let Some(s) = submissions
            .iter_mut()
            .find(|s| s.id == id && s.status == SubmissionStatus::Pending)
        {
            s.claimed_at = None;
        }
        Ok(())
    }

    async fn record_verdict(
        &self,
        id: i64,
        judged: &JudgedSubmission,
    ) -> anyhow::Result<Submission> {
        if self.fail_verdict_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("submission storage read-only"));
        }
        let mut submissions = self.submissions.lock();
        let submission = submissions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| anyhow!("Submission {id} not found"))?;

        let mut state = VerdictState::from_status(submission.status);
        state.resolve(judged.status)?;

        submission.status = state.status();
        submission.execution_time_ms = Some(judged.execution_time_ms);
        submission.memory_used_kb = Some(judged.memory_used_kb);
        submission.score = judged.score;
        submission.error_message = judged.error_message.clone();
        submission.passed_test_cases = judged.passed_test_cases;
        submission.total_test_cases = judged.total_test_cases;
        submission.judged_at = Some(judged.judged_at.clone());
        Ok(submission.clone())
    }
}

pub fn limits() -> Limits {
    Limits::default()
}

pub fn assert_dir_empty(path: &Path) {
    let leftovers: Vec<_> = std::fs::read_dir(path)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert!(leftovers.is_empty(), "leftover entries: {leftovers:?}");
}
