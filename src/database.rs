use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::config::ProblemConfig;
use crate::store::{
    JudgedSubmission, NewSubmission, Problem, ProblemStore, Submission, SubmissionStore, TestCase,
};
use crate::verdict::{SubmissionStatus, TransitionError, VerdictState};

const DATABASE_NAME: &str = "sandjudge.sqlite3";

pub fn get_db_path() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "sandjudge")
        .context("Unable to find user directory")?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).context("Failed to create local data dir")?;

    Ok(data_dir.join(DATABASE_NAME))
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

/// Problems, test cases and submissions kept in one SQLite file
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct SubmissionRow {
    id: i64,
    user_id: i64,
    problem_id: i64,
    contest_id: Option<i64>,
    language: String,
    code: String,
    status: String,
    execution_time_ms: Option<i64>,
    memory_used_kb: Option<i64>,
    score: i64,
    error_message: Option<String>,
    passed_test_cases: i64,
    total_test_cases: i64,
    submitted_at: String,
    judged_at: Option<String>,
    claimed_at: Option<String>,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = anyhow::Error;

    fn try_from(row: SubmissionRow) -> anyhow::Result<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            problem_id: row.problem_id,
            contest_id: row.contest_id,
            language: row.language,
            code: row.code,
            status: row
                .status
                .parse()
                .with_context(|| format!("Corrupt status of submission {}", row.id))?,
            execution_time_ms: row.execution_time_ms.map(|ms| ms.max(0) as u64),
            memory_used_kb: row.memory_used_kb.map(|kb| kb.max(0) as u64),
            score: row.score.max(0) as u32,
            error_message: row.error_message,
            passed_test_cases: row.passed_test_cases.max(0) as u32,
            total_test_cases: row.total_test_cases.max(0) as u32,
            submitted_at: row.submitted_at,
            judged_at: row.judged_at,
            claimed_at: row.claimed_at,
        })
    }
}

const SUBMISSION_COLUMNS: &str = "id, user_id, problem_id, contest_id, language, code, status, \
     execution_time_ms, memory_used_kb, score, error_message, passed_test_cases, \
     total_test_cases, submitted_at, judged_at, claimed_at";

impl SqliteStore {
    pub async fn open(db_path: impl AsRef<Path>) -> sqlx::Result<Self> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .min_connections(0)
            .connect(&db_url)
            .await?;

        // PRAGMA statements cannot run inside a transaction
        for pragma_sql in &[
            "PRAGMA foreign_keys = ON;",
            "PRAGMA busy_timeout = 2000;",
            "PRAGMA journal_mode = WAL;",
            "PRAGMA synchronous = NORMAL;",
        ] {
            sqlx::query(pragma_sql).execute(&pool).await?;
        }

        let mut tx = pool.begin().await?;

        for sql in &[
            r"
            CREATE TABLE IF NOT EXISTS problems (
                id                  INTEGER PRIMARY KEY,
                title               TEXT    NOT NULL,
                base_score          INTEGER NOT NULL DEFAULT 100,
                submission_count    INTEGER NOT NULL DEFAULT 0,
                accepted_count      INTEGER NOT NULL DEFAULT 0
            );",
            r"
            CREATE TABLE IF NOT EXISTS test_cases (
                id                  INTEGER PRIMARY KEY,
                problem_id          INTEGER NOT NULL,
                input               TEXT    NOT NULL,
                expected_output     TEXT    NOT NULL,
                hidden              INTEGER NOT NULL DEFAULT 0,
                order_index         INTEGER NOT NULL,
                FOREIGN KEY (problem_id) REFERENCES problems (id) ON DELETE CASCADE
            );",
            r"
            CREATE TABLE IF NOT EXISTS submissions (
                id                  INTEGER PRIMARY KEY,
                user_id             INTEGER NOT NULL,
                problem_id          INTEGER NOT NULL,
                contest_id          INTEGER,
                language            TEXT    NOT NULL,
                code                TEXT    NOT NULL,
                status              TEXT    NOT NULL DEFAULT 'PENDING',
                execution_time_ms   INTEGER,
                memory_used_kb      INTEGER,
                score               INTEGER NOT NULL DEFAULT 0,
                error_message       TEXT,
                passed_test_cases   INTEGER NOT NULL DEFAULT 0,
                total_test_cases    INTEGER NOT NULL DEFAULT 0,
                submitted_at        TEXT    NOT NULL,
                judged_at           TEXT,
                claimed_at          TEXT,
                FOREIGN KEY (problem_id) REFERENCES problems (id)
            );",
            "CREATE INDEX IF NOT EXISTS idx_test_cases_problem ON test_cases (problem_id, order_index);",
            "CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions (status, id);",
        ] {
            sqlx::query(sql).execute(tx.as_mut()).await?;
        }

        // Databases created before submissions could be claimed
        let (claim_columns,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pragma_table_info('submissions') WHERE name = 'claimed_at'",
        )
        .fetch_one(tx.as_mut())
        .await?;
        if claim_columns == 0 {
            sqlx::query("ALTER TABLE submissions ADD COLUMN claimed_at TEXT")
                .execute(tx.as_mut())
                .await?;
        }

        tx.commit().await?;

        log::info!("Initialized database at {}", db_path.as_ref().display());

        Ok(Self { pool })
    }

    /// Waits for every pooled connection to close
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Replaces the stored problems and their test cases with `problems`
    ///
    /// Cases without an explicit order index keep their position in the list.
    pub async fn sync_problems(&self, problems: &[ProblemConfig]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        for problem in problems {
            sqlx::query(
                r"
                INSERT INTO problems (id, title, base_score) VALUES (?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET title = excluded.title, base_score = excluded.base_score
                ",
            )
            .bind(problem.id)
            .bind(&problem.title)
            .bind(problem.base_score)
            .execute(tx.as_mut())
            .await?;

            sqlx::query("DELETE FROM test_cases WHERE problem_id = ?")
                .bind(problem.id)
                .execute(tx.as_mut())
                .await?;

            for (index, case) in problem.cases.iter().enumerate() {
                sqlx::query(
                    r"
                    INSERT INTO test_cases (problem_id, input, expected_output, hidden, order_index)
                    VALUES (?, ?, ?, ?, ?)
                    ",
                )
                .bind(problem.id)
                .bind(&case.input)
                .bind(&case.expected_output)
                .bind(case.hidden)
                .bind(case.order_index.unwrap_or(index as i32))
                .execute(tx.as_mut())
                .await?;
            }
        }

        tx.commit().await?;
        log::info!("Synchronized {} problems into database", problems.len());
        Ok(())
    }

    /// Submission and acceptance counters of a problem
    pub async fn problem_counters(&self, problem_id: i64) -> anyhow::Result<Option<(u32, u32)>> {
        let counters: Option<(i64, i64)> = sqlx::query_as(
            "SELECT submission_count, accepted_count FROM problems WHERE id = ?",
        )
        .bind(problem_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(counters.map(|(submitted, accepted)| (submitted as u32, accepted as u32)))
    }

    /// Returns submissions claimed before `claimed_before` to the pending scan
    ///
    /// A claim outlives its judge loop only when the process holding it died.
    pub async fn release_stale_claims(&self, claimed_before: &str) -> anyhow::Result<u64> {
        let released = sqlx::query(
            r"
            UPDATE submissions SET claimed_at = NULL
            WHERE status = 'PENDING' AND claimed_at IS NOT NULL AND claimed_at < ?
            ",
        )
        .bind(claimed_before)
        .execute(&self.pool)
        .await
        .context("Failed to release stale submission claims")?
        .rows_affected();

        if released > 0 {
            log::warn!("Released {released} stale submission claims");
        }
        Ok(released)
    }

    async fn fetch_submission<'e, E>(
        &self,
        executor: E,
        id: i64,
    ) -> anyhow::Result<Option<Submission>>
    where
        E: sqlx::sqlite::SqliteExecutor<'e>,
    {
        let sql = format!("SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = ?");
        let row: Option<SubmissionRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await?;

        row.map(Submission::try_from).transpose()
    }
}

#[async_trait]
impl ProblemStore for SqliteStore {
    async fn problem(&self, id: i64) -> anyhow::Result<Option<Problem>> {
        let problem = sqlx::query_as::<_, Problem>(
            "SELECT id, title, base_score FROM problems WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load problem {id}"))?;

        Ok(problem)
    }

    async fn test_cases_for_problem(&self, problem_id: i64) -> anyhow::Result<Vec<TestCase>> {
        let cases = sqlx::query_as::<_, TestCase>(
            r"
            SELECT id, problem_id, input, expected_output, hidden, order_index
            FROM test_cases
            WHERE problem_id = ?
            ORDER BY order_index, id
            ",
        )
        .bind(problem_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to load test cases of problem {problem_id}"))?;

        Ok(cases)
    }
}

#[async_trait]
impl SubmissionStore for SqliteStore {
    async fn create_submission(
        &self,
        submission: &NewSubmission,
        submitted_at: &str,
        claimed: bool,
    ) -> anyhow::Result<Submission> {
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query(
            r"
            INSERT INTO submissions
                (user_id, problem_id, contest_id, language, code, status, submitted_at, claimed_at)
            VALUES (?, ?, ?, ?, ?, 'PENDING', ?, ?)
            ",
        )
        .bind(submission.user_id)
        .bind(submission.problem_id)
        .bind(submission.contest_id)
        .bind(&submission.language)
        .bind(&submission.code)
        .bind(submitted_at)
        .bind(claimed.then_some(submitted_at))
        .execute(tx.as_mut())
        .await
        .with_context(|| format!("Failed to store submission for problem {}", submission.problem_id))?
        .last_insert_rowid();

        let created = self
            .fetch_submission(tx.as_mut(), id)
            .await?
            .ok_or_else(|| anyhow!("Submission {id} vanished after insert"))?;

        tx.commit().await?;
        log::debug!("Created submission {id}");
        Ok(created)
    }

    async fn submission(&self, id: i64) -> anyhow::Result<Option<Submission>> {
        self.fetch_submission(&self.pool, id).await
    }

    async fn pending_submissions(&self, limit: u32) -> anyhow::Result<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            r"
            SELECT id FROM submissions
            WHERE status = 'PENDING' AND claimed_at IS NULL
            ORDER BY id LIMIT ?
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn claim_submission(&self, id: i64, claimed_at: &str) -> anyhow::Result<bool> {
        let claimed = sqlx::query(
            r"
            UPDATE submissions SET claimed_at = ?
            WHERE id = ? AND status = 'PENDING' AND claimed_at IS NULL
            ",
        )
        .bind(claimed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to claim submission {id}"))?
        .rows_affected();

        Ok(claimed == 1)
    }

    async fn release_submission(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE submissions SET claimed_at = NULL WHERE id = ? AND status = 'PENDING'")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to release submission {id}"))?;
        Ok(())
    }

    async fn record_verdict(
        &self,
        id: i64,
        judged: &JudgedSubmission,
    ) -> anyhow::Result<Submission> {
        VerdictState::pending().resolve(judged.status)?;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE submissions
            SET status = ?, execution_time_ms = ?, memory_used_kb = ?, score = ?,
                error_message = ?, passed_test_cases = ?, total_test_cases = ?, judged_at = ?
            WHERE id = ? AND status = 'PENDING'
            ",
        )
        .bind(judged.status.as_str())
        .bind(judged.execution_time_ms as i64)
        .bind(judged.memory_used_kb as i64)
        .bind(judged.score)
        .bind(&judged.error_message)
        .bind(judged.passed_test_cases)
        .bind(judged.total_test_cases)
        .bind(&judged.judged_at)
        .bind(id)
        .execute(tx.as_mut())
        .await?
        .rows_affected();

        if updated == 0 {
            let current = self
                .fetch_submission(tx.as_mut(), id)
                .await?
                .ok_or_else(|| anyhow!("Submission {id} not found"))?;
            return Err(TransitionError::AlreadyResolved(current.status).into());
        }

        let accepted = i64::from(judged.status == SubmissionStatus::Accepted);
        sqlx::query(
            r"
            UPDATE problems
            SET submission_count = submission_count + 1, accepted_count = accepted_count + ?
            WHERE id = (SELECT problem_id FROM submissions WHERE id = ?)
            ",
        )
        .bind(accepted)
        .bind(id)
        .execute(tx.as_mut())
        .await?;

        let recorded = self
            .fetch_submission(tx.as_mut(), id)
            .await?
            .ok_or_else(|| anyhow!("Submission {id} vanished after update"))?;

        tx.commit().await?;
        Ok(recorded)
    }
}
