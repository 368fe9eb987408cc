mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use sandjudge::create_timestamp;
use sandjudge::queue::JobQueue;
use sandjudge::service::JudgeService;
use sandjudge::store::{NewSubmission, Problem, SubmissionStore};
use sandjudge::verdict::SubmissionStatus;
use sandjudge::worker::{scan_pending, worker};

use common::{FakeRuntime, MemoryStore, limits, registry, test_case};

#[tokio::test]
async fn test_workers_drain_pending_submissions() {
    let store = Arc::new(MemoryStore::with_problem(
        Problem {
            id: 1,
            title: "Echo".to_string(),
            base_score: 100,
        },
        vec![test_case(1, 0, "", "ok")],
    ));
    let service = JudgeService::new(
        Arc::new(FakeRuntime::echo_code(5)),
        Arc::new(registry()),
        limits(),
        store.clone(),
        store.clone(),
    );

    let mut ids = Vec::new();
    for code in ["ok", "nope", "ok", "ok"] {
        let created = store
            .create_submission(
                &NewSubmission {
                    user_id: 1,
                    problem_id: 1,
                    contest_id: None,
                    language: "SH".to_string(),
                    code: code.to_string(),
                },
                &create_timestamp(),
                false,
            )
            .await
            .unwrap();
        ids.push(created.id);
    }

    let queue = Arc::new(JobQueue::new());
    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();
    for i in 1..=2 {
        tasks.spawn(worker(
            i,
            service.clone(),
            queue.clone(),
            shutdown.clone(),
            abort.clone(),
        ));
    }
    tasks.spawn(scan_pending(
        store.clone(),
        queue.clone(),
        Duration::from_millis(10),
        shutdown.clone(),
    ));

    for _ in 0..200 {
        if store.pending_submissions(10).await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    while let Some(res) = tasks.join_next().await {
        res.unwrap().unwrap();
    }

    let mut statuses = Vec::new();
    for id in ids {
        statuses.push(store.submission(id).await.unwrap().unwrap().status);
    }
    assert_eq!(
        statuses,
        vec![
            SubmissionStatus::Accepted,
            SubmissionStatus::WrongAnswer,
            SubmissionStatus::Accepted,
            SubmissionStatus::Accepted,
        ]
    );
}

#[tokio::test]
async fn test_direct_submission_is_not_picked_up_by_workers() {
    let store = Arc::new(MemoryStore::with_problem(
        Problem {
            id: 1,
            title: "Echo".to_string(),
            base_score: 100,
        },
        vec![test_case(1, 0, "", "ok")],
    ));
    let runtime = Arc::new(FakeRuntime::echo_code(5).delayed(Duration::from_millis(300)));
    let service = JudgeService::new(
        runtime.clone(),
        Arc::new(registry()),
        limits(),
        store.clone(),
        store.clone(),
    );

    let queue = Arc::new(JobQueue::new());
    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(worker(
        1,
        service.clone(),
        queue.clone(),
        shutdown.clone(),
        CancellationToken::new(),
    ));
    tasks.spawn(scan_pending(
        store.clone(),
        queue.clone(),
        Duration::from_millis(10),
        shutdown.clone(),
    ));

    let (submission, _) = service
        .submit(
            NewSubmission {
                user_id: 1,
                problem_id: 1,
                contest_id: None,
                language: "SH".to_string(),
                code: "ok".to_string(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    shutdown.cancel();
    while let Some(res) = tasks.join_next().await {
        res.unwrap().unwrap();
    }

    assert_eq!(submission.status, SubmissionStatus::Accepted);
    assert_eq!(runtime.prepared(), 1);
    assert!(!queue.is_tracked(submission.id));
}
