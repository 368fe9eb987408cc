use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use sandjudge::config::{CliArgs, Command};
use sandjudge::database::{self as db, SqliteStore};
use sandjudge::language::LanguageRegistry;
use sandjudge::queue::JobQueue;
use sandjudge::sandbox::{SandboxRuntime, create_sandbox_runtime};
use sandjudge::service::JudgeService;
use sandjudge::store::NewSubmission;
use sandjudge::timestamp_before;
use sandjudge::worker::{scan_pending, worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;

    let db_path = match &config.database.path {
        Some(path) => path.clone(),
        None => db::get_db_path()?,
    };
    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let store = Arc::new(
        SqliteStore::open(&db_path)
            .await
            .context("Failed to initialize database")?,
    );
    store.sync_problems(&config.problems).await?;

    let runtime: Arc<dyn SandboxRuntime> =
        Arc::from(create_sandbox_runtime(&config.sandbox, &config.limits)?);
    log::info!("Judging with the {} sandbox", runtime.name());

    let languages = Arc::new(LanguageRegistry::new(config.languages));
    let mut language_names: Vec<_> = languages.names().collect();
    language_names.sort_unstable();
    log::info!("Languages available: {}", language_names.join(", "));

    let service = JudgeService::new(
        runtime.clone(),
        languages,
        config.limits.run_limits(),
        store.clone(),
        store.clone(),
    );

    // ======= PREPARATION END, EXECUTION START =======

    let result = match cli.command {
        Command::Run {
            problem,
            language,
            source,
        } => run_once(&service, problem, &language, &source).await,
        Command::Submit {
            user,
            problem,
            contest,
            language,
            source,
        } => {
            let code = read_source(&source).await?;
            let submission = NewSubmission {
                user_id: user,
                problem_id: problem,
                contest_id: contest,
                language,
                code,
            };
            submit_once(&service, submission).await
        }
        Command::Worker {
            threads,
            poll_interval_ms,
            claim_timeout_secs,
        } => {
            store
                .release_stale_claims(&timestamp_before(Duration::from_secs(claim_timeout_secs)))
                .await?;
            serve(
                service,
                store.clone(),
                threads,
                Duration::from_millis(poll_interval_ms),
            )
            .await
        }
    };

    runtime.shutdown();
    store.close().await;
    log::info!("Shutdown complete");
    result
}

async fn read_source(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read source file {}", path.display()))
}

async fn run_once(
    service: &JudgeService,
    problem_id: i64,
    language: &str,
    source: &Path,
) -> anyhow::Result<()> {
    let code = read_source(source).await?;
    let verdict = service.execute_code(problem_id, &code, language).await;
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(())
}

async fn submit_once(service: &JudgeService, submission: NewSubmission) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Ctrl-c received, cancelling judging");
                cancel.cancel();
            }
        }
    });

    let judged = service.submit(submission, &cancel).await;
    interrupt.abort();

    let (submission, verdict) = judged?;
    let report = serde_json::json!({
        "submission": submission,
        "verdict": verdict,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn serve(
    service: JudgeService,
    store: Arc<SqliteStore>,
    n_threads: u8,
    poll_interval: Duration,
) -> anyhow::Result<()> {
    if n_threads == 0 {
        anyhow::bail!("The number of worker threads must not be 0");
    }

    let job_queue = Arc::new(JobQueue::new());
    let shutdown_token = CancellationToken::new();
    let abort_token = CancellationToken::new();

    let mut workers = JoinSet::new();
    for i in 1..=n_threads {
        workers.spawn(worker(
            i,
            service.clone(),
            job_queue.clone(),
            shutdown_token.clone(),
            abort_token.clone(),
        ));
    }
    workers.spawn(scan_pending(
        store,
        job_queue,
        poll_interval,
        shutdown_token.clone(),
    ));

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Stop taking new submissions
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for in-flight judging (Ctrl-c again to abort)...");

    // 2. Wait until every worker terminates, aborting judging on a second Ctrl-c
    loop {
        tokio::select! {
            res = workers.join_next() => match res {
                None => break,
                Some(Err(e)) if e.is_panic() => log::error!("Worker handle panicked: {:?}", e),
                Some(Err(e)) => log::error!("Worker handle finished with error: {:?}", e),
                Some(Ok(Err(e))) => log::error!("Worker stopped with error: {e:#}"),
                Some(Ok(Ok(()))) => {}
            },
            _ = tokio::signal::ctrl_c(), if !abort_token.is_cancelled() => {
                log::warn!("Second Ctrl-c received, cancelling in-flight judging (submissions stay pending)");
                abort_token.cancel();
            }
        }
    }

    Ok(())
}
