mod common;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use sandjudge::error::JudgeError;
use sandjudge::judge::{ACCEPTED_OUTPUT, CANCELLED_MESSAGE, JudgeLoop, NO_TEST_CASES_MESSAGE};
use sandjudge::sandbox::OutcomeStatus;
use sandjudge::verdict::SubmissionStatus;

use common::{FakeRuntime, exited, limits, outcome, registry, test_case};

#[tokio::test]
async fn test_empty_test_cases_never_touch_the_sandbox() {
    let runtime = FakeRuntime::echo_code(10);
    let languages = registry();
    let limits = limits();
    let judge = JudgeLoop::new(&runtime, &languages, &limits);

    let verdict = judge
        .run("print(42)", "PYTHON", &[], &CancellationToken::new())
        .await;

    assert_eq!(verdict.status, SubmissionStatus::Error);
    assert_eq!(verdict.passed_test_cases, 0);
    assert_eq!(verdict.total_test_cases, 0);
    assert_eq!(verdict.error_message.as_deref(), Some(NO_TEST_CASES_MESSAGE));
    assert_eq!(runtime.prepared(), 0);
}

#[tokio::test]
async fn test_unsupported_language_is_rejected_before_prepare() {
    let runtime = FakeRuntime::echo_code(10);
    let languages = registry();
    let limits = limits();
    let judge = JudgeLoop::new(&runtime, &languages, &limits);
    let cases = [test_case(1, 0, "", "42")];

    let verdict = judge
        .run("42", "COBOL", &cases, &CancellationToken::new())
        .await;

    assert_eq!(verdict.status, SubmissionStatus::Error);
    assert_eq!(verdict.passed_test_cases, 0);
    assert_eq!(verdict.total_test_cases, 1);
    assert_eq!(
        verdict.error_message.as_deref(),
        Some("Unsupported language: COBOL")
    );
    assert_eq!(runtime.prepared(), 0);
}

#[tokio::test]
async fn test_accepted_sums_durations_in_order_index_order() {
    let runtime = FakeRuntime::new(|_, input| Ok(exited(input, input.len() as u64 * 100)));
    let languages = registry();
    let limits = limits();
    let judge = JudgeLoop::new(&runtime, &languages, &limits);
    // Stored out of order on purpose
    let cases = [
        test_case(1, 2, "ccc", "ccc"),
        test_case(2, 0, "a", "a"),
        test_case(3, 1, "bb", "bb\n"),
    ];

    let verdict = judge
        .run("cat", "python", &cases, &CancellationToken::new())
        .await;

    assert_eq!(verdict.status, SubmissionStatus::Accepted);
    assert_eq!(verdict.passed_test_cases, 3);
    assert_eq!(verdict.total_test_cases, 3);
    assert_eq!(verdict.execution_time_ms, 600);
    assert_eq!(verdict.output.as_deref(), Some(ACCEPTED_OUTPUT));
    assert_eq!(verdict.error_message, None);
    assert_eq!(runtime.inputs(), vec!["a", "bb", "ccc"]);
    assert_eq!(runtime.live_workspaces(), 0);
}

#[tokio::test]
async fn test_fail_fast_stops_at_first_wrong_answer() {
    let runtime = FakeRuntime::new(|_, input| {
        let answer = if input == "2" { "wrong" } else { input };
        Ok(exited(answer, 40))
    });
    let languages = registry();
    let limits = limits();
    let judge = JudgeLoop::new(&runtime, &languages, &limits);
    let cases = [
        test_case(1, 0, "1", "1"),
        test_case(2, 1, "2", "2"),
        test_case(3, 2, "3", "3"),
    ];

    let verdict = judge
        .run("cat", "PYTHON", &cases, &CancellationToken::new())
        .await;

    assert_eq!(verdict.status, SubmissionStatus::WrongAnswer);
    assert_eq!(verdict.passed_test_cases, 1);
    assert_eq!(verdict.total_test_cases, 3);
    assert_eq!(verdict.output.as_deref(), Some("wrong"));
    assert_eq!(verdict.execution_time_ms, 40);
    assert_eq!(runtime.inputs(), vec!["1", "2"]);
    assert_eq!(runtime.live_workspaces(), 0);
}

#[tokio::test]
async fn test_outcome_statuses_become_verdicts() {
    let cases_for = [
        (OutcomeStatus::TimeLimitExceeded, SubmissionStatus::TimeLimitExceeded),
        (OutcomeStatus::MemoryLimitExceeded, SubmissionStatus::MemoryLimitExceeded),
        (OutcomeStatus::RuntimeError, SubmissionStatus::RuntimeError),
        (OutcomeStatus::CompilationError, SubmissionStatus::CompilationError),
    ];

    for (outcome_status, expected) in cases_for {
        let runtime = FakeRuntime::new(move |_, input| {
            if input == "first" {
                Ok(exited("ok", 5))
            } else {
                Ok(outcome(outcome_status, "", 5000))
            }
        });
        let languages = registry();
        let limits = limits();
        let judge = JudgeLoop::new(&runtime, &languages, &limits);
        let cases = [
            test_case(1, 0, "first", "ok"),
            test_case(2, 1, "second", "ok"),
            test_case(3, 2, "third", "ok"),
        ];

        let verdict = judge
            .run("code", "CPP", &cases, &CancellationToken::new())
            .await;

        assert_eq!(verdict.status, expected);
        assert_eq!(verdict.passed_test_cases, 1);
        assert_eq!(verdict.total_test_cases, 3);
        assert_eq!(verdict.execution_time_ms, 5000);
        assert_eq!(runtime.inputs().len(), 2);
    }
}

#[tokio::test]
async fn test_sandbox_failure_resolves_to_error_with_progress() {
    let runtime = FakeRuntime::new(|_, input| {
        if input == "boom" {
            Err(JudgeError::SandboxUnavailable("isolate --init failed".into()))
        } else {
            Ok(exited(input, 1))
        }
    });
    let languages = registry();
    let limits = limits();
    let judge = JudgeLoop::new(&runtime, &languages, &limits);
    let cases = [
        test_case(1, 0, "a", "a"),
        test_case(2, 1, "boom", "boom"),
        test_case(3, 2, "c", "c"),
    ];

    let verdict = judge
        .run("cat", "SH", &cases, &CancellationToken::new())
        .await;

    assert_eq!(verdict.status, SubmissionStatus::Error);
    assert_eq!(verdict.passed_test_cases, 1);
    assert_eq!(verdict.total_test_cases, 3);
    assert_eq!(
        verdict.error_message.as_deref(),
        Some("Sandbox unavailable: isolate --init failed")
    );
    assert_eq!(runtime.live_workspaces(), 0);
}

#[tokio::test]
async fn test_cancelled_judging_resolves_to_error() {
    let runtime = FakeRuntime::echo_code(10);
    let languages = registry();
    let limits = limits();
    let judge = JudgeLoop::new(&runtime, &languages, &limits);
    let cases = [test_case(1, 0, "", "42")];
    let cancel = CancellationToken::new();
    cancel.cancel();

    let verdict = judge.run("42", "SH", &cases, &cancel).await;

    assert_eq!(verdict.status, SubmissionStatus::Error);
    assert_eq!(verdict.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(verdict.total_test_cases, 1);
    assert_eq!(runtime.prepared(), 0);
}

#[tokio::test]
async fn test_hidden_case_does_not_leak_expected_output() {
    let runtime = FakeRuntime::echo_code(10);
    let languages = registry();
    let limits = limits();
    let judge = JudgeLoop::new(&runtime, &languages, &limits);
    let mut hidden = test_case(1, 0, "", "the secret answer");
    hidden.hidden = true;

    let verdict = judge
        .run("a guess", "SH", &[hidden], &CancellationToken::new())
        .await;

    assert_eq!(verdict.status, SubmissionStatus::WrongAnswer);
    let message = verdict.error_message.unwrap();
    assert!(!message.contains("the secret answer"), "{message}");
}
