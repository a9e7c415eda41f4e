use std::path::Path;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScrapeError};
use crate::grammar::{Mode, Person, Task};
use crate::parser::PersonForms;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// RFC 3339 UTC with fixed precision so stored timestamps sort as text.
pub fn timestamp(at: chrono::DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now() -> String {
    timestamp(Utc::now())
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS verbs (
            id          INTEGER PRIMARY KEY,
            infinitive  TEXT UNIQUE NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS modes (
            id    INTEGER PRIMARY KEY,
            name  TEXT UNIQUE NOT NULL
                  CHECK(name IN ('Indicativo','Subjuntivo','Imperativo'))
        );

        CREATE TABLE IF NOT EXISTS tenses (
            id       INTEGER PRIMARY KEY,
            mode_id  INTEGER NOT NULL REFERENCES modes(id),
            name     TEXT NOT NULL,
            UNIQUE(mode_id, name)
        );

        CREATE TABLE IF NOT EXISTS persons (
            id          INTEGER PRIMARY KEY,
            name        TEXT UNIQUE NOT NULL,
            sort_order  INTEGER UNIQUE NOT NULL
        );

        -- Fact table: one row per (verb, tense, person); tense carries the mode.
        CREATE TABLE IF NOT EXISTS conjugations (
            id         INTEGER PRIMARY KEY,
            verb_id    INTEGER NOT NULL REFERENCES verbs(id),
            tense_id   INTEGER NOT NULL REFERENCES tenses(id),
            person_id  INTEGER NOT NULL REFERENCES persons(id),
            value      TEXT NOT NULL,
            UNIQUE(verb_id, tense_id, person_id)
        );
        CREATE INDEX IF NOT EXISTS idx_conjugations_verb ON conjugations(verb_id);

        CREATE TABLE IF NOT EXISTS batch_jobs (
            id             TEXT PRIMARY KEY,
            status         TEXT NOT NULL
                           CHECK(status IN ('pending','processing','completed','failed')),
            total_tasks    INTEGER NOT NULL,
            success_count  INTEGER NOT NULL DEFAULT 0,
            failed_count   INTEGER NOT NULL DEFAULT 0,
            created_at     TEXT NOT NULL,
            completed_at   TEXT,
            CHECK(success_count + failed_count <= total_tasks)
        );
        CREATE INDEX IF NOT EXISTS idx_batch_jobs_terminal ON batch_jobs(status, completed_at);

        CREATE TABLE IF NOT EXISTS batch_tasks (
            job_id        TEXT NOT NULL REFERENCES batch_jobs(id) ON DELETE CASCADE,
            position      INTEGER NOT NULL,
            verb          TEXT NOT NULL,
            mode          TEXT NOT NULL,
            tense         TEXT NOT NULL,
            outcome       TEXT CHECK(outcome IN ('success','failed')),
            error_kind    TEXT,
            error_detail  TEXT,
            finished_at   TEXT,
            PRIMARY KEY(job_id, position)
        );
        ",
    )?;
    seed_reference_data(conn)
}

/// Modes, tenses and persons are closed sets; seeding is idempotent.
pub fn seed_reference_data(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    {
        let mut mode_stmt = tx.prepare("INSERT OR IGNORE INTO modes (name) VALUES (?1)")?;
        let mut tense_stmt = tx.prepare(
            "INSERT OR IGNORE INTO tenses (mode_id, name)
             SELECT id, ?2 FROM modes WHERE name = ?1",
        )?;
        for mode in Mode::ALL {
            mode_stmt.execute([mode.name()])?;
            for tense in mode.tenses() {
                tense_stmt.execute(params![mode.name(), tense])?;
            }
        }

        let mut person_stmt =
            tx.prepare("INSERT OR IGNORE INTO persons (name, sort_order) VALUES (?1, ?2)")?;
        for person in Person::ALL {
            person_stmt.execute(params![person.name(), person.sort_order()])?;
        }
    }
    tx.commit()?;
    Ok(())
}

// ── Conjugations ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConjugationRow {
    pub verb: String,
    pub mode: String,
    pub tense: String,
    pub person: String,
    pub value: String,
}

/// Write all six rows for one (verb, mode, tense) or none of them.
///
/// `BEGIN IMMEDIATE` takes the write lock up front, so two writers of the same
/// key queue on `busy_timeout` instead of failing mid-transaction.
pub fn upsert_conjugations(conn: &mut Connection, task: &Task, forms: &PersonForms) -> Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    tx.execute(
        "INSERT OR IGNORE INTO verbs (infinitive, created_at) VALUES (?1, ?2)",
        params![task.verb(), now()],
    )?;
    let verb_id: i64 =
        tx.query_row("SELECT id FROM verbs WHERE infinitive = ?1", [task.verb()], |r| r.get(0))?;

    let tense_id: i64 = tx
        .query_row(
            "SELECT t.id FROM tenses t JOIN modes m ON m.id = t.mode_id
             WHERE m.name = ?1 AND t.name = ?2",
            params![task.mode().name(), task.tense()],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| {
            ScrapeError::Persistence(format!(
                "no reference row for {} {}",
                task.mode(),
                task.tense()
            ))
        })?;

    let mut written = 0;
    {
        let mut person_stmt = tx.prepare("SELECT id FROM persons WHERE name = ?1")?;
        let mut upsert = tx.prepare(
            "INSERT INTO conjugations (verb_id, tense_id, person_id, value)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(verb_id, tense_id, person_id) DO UPDATE SET value = excluded.value",
        )?;
        for (person, value) in forms.iter() {
            let person_id: i64 = person_stmt
                .query_row([person.name()], |r| r.get(0))
                .optional()?
                .ok_or_else(|| {
                    ScrapeError::Persistence(format!("no reference row for person {}", person.name()))
                })?;
            written += upsert.execute(params![verb_id, tense_id, person_id, value])?;
        }
    }

    tx.commit()?;
    Ok(written)
}

const CONJUGATION_SELECT: &str = "
    SELECT v.infinitive, m.name, t.name, p.name, c.value
    FROM conjugations c
    JOIN verbs v   ON v.id = c.verb_id
    JOIN tenses t  ON t.id = c.tense_id
    JOIN modes m   ON m.id = t.mode_id
    JOIN persons p ON p.id = c.person_id";

fn map_conjugation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConjugationRow> {
    Ok(ConjugationRow {
        verb: row.get(0)?,
        mode: row.get(1)?,
        tense: row.get(2)?,
        person: row.get(3)?,
        value: row.get(4)?,
    })
}

pub fn fetch_conjugations(
    conn: &Connection,
    verb: &str,
    mode: Mode,
    tense: &str,
) -> Result<Vec<ConjugationRow>> {
    let sql = format!(
        "{} WHERE v.infinitive = ?1 AND m.name = ?2 AND t.name = ?3 ORDER BY p.sort_order",
        CONJUGATION_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![verb, mode.name(), tense], map_conjugation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn fetch_verb_conjugations(conn: &Connection, verb: &str) -> Result<Vec<ConjugationRow>> {
    let sql = format!(
        "{} WHERE v.infinitive = ?1 ORDER BY m.id, t.id, p.sort_order",
        CONJUGATION_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([verb], map_conjugation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn verb_exists(conn: &Connection, verb: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM verbs WHERE infinitive = ?1", [verb], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

// ── Batch jobs ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<JobStatus> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ScrapeError::Persistence(format!("unknown job status '{}'", other))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failed { kind: String, detail: String },
}

impl TaskOutcome {
    pub fn from_error(e: &ScrapeError) -> Self {
        TaskOutcome::Failed {
            kind: e.kind().to_string(),
            detail: e.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub status: JobStatus,
    pub total: u32,
    pub success: u32,
    pub failed: u32,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub position: u32,
    pub verb: String,
    pub mode: String,
    pub tense: String,
    pub outcome: Option<String>,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
}

/// Insert a job and its ordered task list. An empty list is born completed.
pub fn insert_job(conn: &mut Connection, job_id: &str, tasks: &[Task]) -> Result<JobStatus> {
    let created_at = now();
    let (status, completed_at) = if tasks.is_empty() {
        (JobStatus::Completed, Some(created_at.clone()))
    } else {
        (JobStatus::Pending, None)
    };

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "INSERT INTO batch_jobs (id, status, total_tasks, created_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![job_id, status.as_str(), tasks.len() as i64, created_at, completed_at],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO batch_tasks (job_id, position, verb, mode, tense)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (i, t) in tasks.iter().enumerate() {
            stmt.execute(params![job_id, i as i64, t.verb(), t.mode().name(), t.tense()])?;
        }
    }
    tx.commit()?;
    Ok(status)
}

pub fn mark_processing(conn: &Connection, job_id: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE batch_jobs SET status = 'processing' WHERE id = ?1 AND status = 'pending'",
        [job_id],
    )?;
    Ok(n == 1)
}

/// Record one task's outcome, bump the matching counter in SQL, and complete
/// the job in the same transaction once every task is accounted for.
///
/// A task that already has an outcome is left alone, so a redelivered work
/// item cannot count twice.
pub fn record_task_outcome(
    conn: &mut Connection,
    job_id: &str,
    position: u32,
    outcome: &TaskOutcome,
) -> Result<JobStatus> {
    let finished_at = now();
    let (label, kind, detail, success, failed) = match outcome {
        TaskOutcome::Success => ("success", None, None, 1, 0),
        TaskOutcome::Failed { kind, detail } => {
            ("failed", Some(kind.as_str()), Some(detail.as_str()), 0, 1)
        }
    };

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let changed = tx.execute(
        "UPDATE batch_tasks
         SET outcome = ?3, error_kind = ?4, error_detail = ?5, finished_at = ?6
         WHERE job_id = ?1 AND position = ?2 AND outcome IS NULL AND finished_at IS NULL",
        params![job_id, position, label, kind, detail, finished_at],
    )?;
    if changed == 1 {
        tx.execute(
            "UPDATE batch_jobs
             SET success_count = success_count + ?2, failed_count = failed_count + ?3
             WHERE id = ?1",
            params![job_id, success, failed],
        )?;
        tx.execute(
            "UPDATE batch_jobs SET status = 'completed', completed_at = ?2
             WHERE id = ?1 AND status != 'completed'
               AND success_count + failed_count = total_tasks",
            params![job_id, finished_at],
        )?;
    }
    let status: String = tx
        .query_row("SELECT status FROM batch_jobs WHERE id = ?1", [job_id], |r| r.get(0))
        .optional()?
        .ok_or_else(|| ScrapeError::NotFound(format!("job {}", job_id)))?;
    tx.commit()?;
    JobStatus::parse(&status)
}

/// Count a task as failed when its outcome row cannot be written.
///
/// The job counters are what drive completion, so they are bumped even if the
/// task row itself refuses the annotation. A task that already has an outcome
/// or was already abandoned is left alone.
pub fn abandon_task(
    conn: &mut Connection,
    job_id: &str,
    position: u32,
    detail: &str,
) -> Result<JobStatus> {
    let finished_at = now();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let counted: Option<bool> = tx
        .query_row(
            "SELECT outcome IS NOT NULL OR finished_at IS NOT NULL
             FROM batch_tasks WHERE job_id = ?1 AND position = ?2",
            params![job_id, position],
            |r| r.get(0),
        )
        .optional()?;
    if counted != Some(true) {
        // A failing statement only undoes itself, the transaction goes on.
        let _ = tx.execute(
            "UPDATE batch_tasks
             SET error_kind = 'persistence', error_detail = ?3, finished_at = ?4
             WHERE job_id = ?1 AND position = ?2 AND outcome IS NULL",
            params![job_id, position, detail, finished_at],
        );
        tx.execute(
            "UPDATE batch_jobs SET failed_count = failed_count + 1
             WHERE id = ?1 AND success_count + failed_count < total_tasks",
            [job_id],
        )?;
        tx.execute(
            "UPDATE batch_jobs SET status = 'completed', completed_at = ?2
             WHERE id = ?1 AND status != 'completed'
               AND success_count + failed_count = total_tasks",
            params![job_id, finished_at],
        )?;
    }
    let status: String = tx
        .query_row("SELECT status FROM batch_jobs WHERE id = ?1", [job_id], |r| r.get(0))
        .optional()?
        .ok_or_else(|| ScrapeError::NotFound(format!("job {}", job_id)))?;
    tx.commit()?;
    JobStatus::parse(&status)
}

/// Job row plus its tasks, read inside one transaction so counters and task
/// outcomes agree.
pub fn fetch_job(conn: &mut Connection, job_id: &str) -> Result<Option<(JobRow, Vec<TaskRow>)>> {
    let tx = conn.transaction()?;
    let job = tx
        .query_row(
            "SELECT id, status, total_tasks, success_count, failed_count, created_at, completed_at
             FROM batch_jobs WHERE id = ?1",
            [job_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, u32>(2)?,
                    r.get::<_, u32>(3)?,
                    r.get::<_, u32>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((id, status, total, success, failed, created_at, completed_at)) = job else {
        return Ok(None);
    };

    let tasks = {
        let mut stmt = tx.prepare(
            "SELECT position, verb, mode, tense, outcome, error_kind, error_detail
             FROM batch_tasks WHERE job_id = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map([job_id], |r| {
                Ok(TaskRow {
                    position: r.get(0)?,
                    verb: r.get(1)?,
                    mode: r.get(2)?,
                    tense: r.get(3)?,
                    outcome: r.get(4)?,
                    error_kind: r.get(5)?,
                    error_detail: r.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    tx.commit()?;

    let job = JobRow {
        id,
        status: JobStatus::parse(&status)?,
        total,
        success,
        failed,
        created_at,
        completed_at,
    };
    Ok(Some((job, tasks)))
}

// ── Retention ──

/// Terminal jobs whose `completed_at` is strictly before `cutoff`.
pub fn expired_job_ids(conn: &Connection, cutoff: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM batch_jobs
         WHERE status IN ('completed','failed')
           AND completed_at IS NOT NULL AND completed_at < ?1
         ORDER BY completed_at",
    )?;
    let ids = stmt
        .query_map([cutoff], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

/// Delete a terminal job and its tasks. Returns false when the job is gone or
/// no longer terminal.
pub fn delete_job(conn: &mut Connection, job_id: &str) -> Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let terminal: Option<String> = tx
        .query_row(
            "SELECT status FROM batch_jobs WHERE id = ?1 AND status IN ('completed','failed')",
            [job_id],
            |r| r.get(0),
        )
        .optional()?;
    if terminal.is_none() {
        return Ok(false);
    }
    tx.execute("DELETE FROM batch_tasks WHERE job_id = ?1", [job_id])?;
    tx.execute("DELETE FROM batch_jobs WHERE id = ?1", [job_id])?;
    tx.commit()?;
    Ok(true)
}

// ── Stats ──

pub struct Stats {
    pub verbs: usize,
    pub conjugations: usize,
    pub jobs_active: usize,
    pub jobs_completed: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let verbs: usize = conn.query_row("SELECT COUNT(*) FROM verbs", [], |r| r.get(0))?;
    let conjugations: usize =
        conn.query_row("SELECT COUNT(*) FROM conjugations", [], |r| r.get(0))?;
    let jobs_active: usize = conn.query_row(
        "SELECT COUNT(*) FROM batch_jobs WHERE status IN ('pending','processing')",
        [],
        |r| r.get(0),
    )?;
    let jobs_completed: usize = conn.query_row(
        "SELECT COUNT(*) FROM batch_jobs WHERE status IN ('completed','failed')",
        [],
        |r| r.get(0),
    )?;
    Ok(Stats {
        verbs,
        conjugations,
        jobs_active,
        jobs_completed,
    })
}
