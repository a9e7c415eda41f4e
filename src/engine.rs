//! Batch job engine.
//!
//! `submit` stores the job and hands its tasks to a feeder task, which pushes
//! them onto a bounded queue. A fixed set of workers drains the queue, runs
//! each task through [`VerbManager`], and records the outcome. The job flips to
//! `completed` in the same transaction that records its last outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{JobRow, JobStatus, TaskOutcome, TaskRow};
use crate::error::{Result, ScrapeError};
use crate::grammar::{Task, TaskRequest};
use crate::manager::VerbManager;
use crate::store::Store;

const RECORD_ATTEMPTS: u32 = 3;
const RECORD_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub queue_capacity: usize,
    /// Random pause before each task, inclusive range in milliseconds.
    pub jitter_ms: (u64, u64),
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            concurrency: 3,
            queue_capacity: 64,
            jitter_ms: (300, 1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: u32,
    pub success: u32,
    pub failed: u32,
}

impl Progress {
    pub fn done(&self) -> u32 {
        self.success + self.failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub verb: String,
    pub mode: String,
    pub tense: String,
    pub outcome: Option<String>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

/// Point-in-time view of a job, safe to take while workers are running.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: Progress,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskSnapshot>,
}

impl JobSnapshot {
    fn from_rows(job: JobRow, tasks: Vec<TaskRow>) -> Result<Self> {
        Ok(JobSnapshot {
            job_id: job.id,
            status: job.status,
            progress: Progress {
                total: job.total,
                success: job.success,
                failed: job.failed,
            },
            created_at: parse_ts(&job.created_at)?,
            completed_at: job.completed_at.as_deref().map(parse_ts).transpose()?,
            tasks: tasks
                .into_iter()
                .map(|t| TaskSnapshot {
                    verb: t.verb,
                    mode: t.mode,
                    tense: t.tense,
                    outcome: t.outcome,
                    error_kind: t.error_kind,
                    error: t.error_detail,
                })
                .collect(),
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ScrapeError::Persistence(format!("bad timestamp '{}': {}", s, e)))
}

struct WorkItem {
    job_id: Arc<str>,
    position: u32,
    task: Task,
}

pub struct BatchEngine {
    store: Store,
    queue: mpsc::Sender<WorkItem>,
    workers: Vec<JoinHandle<()>>,
}

impl BatchEngine {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(manager: Arc<VerbManager>, config: EngineConfig) -> Self {
        let store = manager.store().clone();
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..config.concurrency.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    rx: Arc::clone(&rx),
                    manager: Arc::clone(&manager),
                    store: store.clone(),
                    jitter_ms: config.jitter_ms,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!("Batch engine started with {} workers", config.concurrency.max(1));
        BatchEngine {
            store,
            queue,
            workers,
        }
    }

    /// Validate every descriptor, then submit. One bad task rejects the batch.
    pub async fn submit(&self, requests: &[TaskRequest]) -> Result<String> {
        let tasks = requests
            .iter()
            .enumerate()
            .map(|(i, req)| {
                Task::from_request(req).map_err(|e| match e {
                    ScrapeError::Validation(msg) => {
                        ScrapeError::Validation(format!("task {}: {}", i, msg))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.submit_tasks(tasks).await
    }

    /// Create the job record and return its id without waiting for any work.
    pub async fn submit_tasks(&self, tasks: Vec<Task>) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let status = self.store.insert_job(&job_id, tasks.clone()).await?;
        if status.is_terminal() {
            info!("Job [{}] has no tasks, completed on submission", job_id);
            return Ok(job_id);
        }
        info!("Job [{}] submitted with {} tasks", job_id, tasks.len());

        // The feeder absorbs queue back-pressure so the caller never waits on it.
        let store = self.store.clone();
        let queue = self.queue.clone();
        let id: Arc<str> = Arc::from(job_id.as_str());
        tokio::spawn(async move {
            match store.mark_processing(&id).await {
                Ok(_) => info!("Job [{}] status updated to processing", id),
                Err(e) => error!("Job [{}] could not be marked processing: {}", id, e),
            }
            for (position, task) in tasks.into_iter().enumerate() {
                let item = WorkItem {
                    job_id: Arc::clone(&id),
                    position: position as u32,
                    task,
                };
                if queue.send(item).await.is_err() {
                    warn!("Job [{}] queue closed after {} tasks", id, position);
                    break;
                }
            }
        });

        Ok(job_id)
    }

    pub async fn status(&self, job_id: &str) -> Result<JobSnapshot> {
        let (job, tasks) = self
            .store
            .fetch_job(job_id)
            .await?
            .ok_or_else(|| ScrapeError::NotFound(format!("job {}", job_id)))?;
        JobSnapshot::from_rows(job, tasks)
    }

    /// Poll until the job is terminal, giving up after `timeout`.
    pub async fn wait(&self, job_id: &str, poll: Duration, timeout: Duration) -> Result<JobSnapshot> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.status(job_id).await?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScrapeError::Timeout(format!(
                    "job {} still {} after {:.1}s ({}/{} tasks done)",
                    job_id,
                    snapshot.status.as_str(),
                    timeout.as_secs_f64(),
                    snapshot.progress.done(),
                    snapshot.progress.total
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Close the queue and let the workers drain what is already in it.
    pub async fn shutdown(self) {
        drop(self.queue);
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!("Worker ended abnormally: {}", e);
            }
        }
        info!("Batch engine stopped");
    }
}

struct Worker {
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    manager: Arc<VerbManager>,
    store: Store,
    jitter_ms: (u64, u64),
}

impl Worker {
    async fn run(self) {
        loop {
            let next = self.rx.lock().await.recv().await;
            let Some(item) = next else {
                break;
            };
            self.pause().await;

            let outcome = match self.manager.run_task(item.task.clone()).await {
                Ok(_) => TaskOutcome::Success,
                Err(e) => {
                    warn!(
                        "[Worker {}] Job [{}] task {} failed: {}",
                        self.id, item.job_id, item.position, e
                    );
                    TaskOutcome::from_error(&e)
                }
            };
            self.record(&item, outcome).await;
        }
    }

    /// Courtesy delay toward the upstream site.
    async fn pause(&self) {
        let (lo, hi) = self.jitter_ms;
        if hi == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(lo.min(hi)..=hi);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn record(&self, item: &WorkItem, outcome: TaskOutcome) {
        let mut last_error = None;
        for attempt in 1..=RECORD_ATTEMPTS {
            match self
                .store
                .record_task_outcome(&item.job_id, item.position, outcome.clone())
                .await
            {
                Ok(status) => return log_status(item, status),
                Err(e) => {
                    warn!(
                        "Recording task {} of job [{}] failed (attempt {}/{}): {}",
                        item.position, item.job_id, attempt, RECORD_ATTEMPTS, e
                    );
                    last_error = Some(e);
                }
            }
            if attempt < RECORD_ATTEMPTS {
                tokio::time::sleep(RECORD_BACKOFF * attempt).await;
            }
        }

        // The outcome row is unwritable; still count the task so the job ends.
        let detail = match last_error {
            Some(e) => format!("outcome not recorded: {}", e),
            None => "outcome not recorded".to_string(),
        };
        for attempt in 1..=RECORD_ATTEMPTS {
            match self
                .store
                .abandon_task(&item.job_id, item.position, detail.clone())
                .await
            {
                Ok(status) => {
                    warn!(
                        "Task {} of job [{}] counted as failed: {}",
                        item.position, item.job_id, detail
                    );
                    return log_status(item, status);
                }
                Err(e) => error!(
                    "Abandoning task {} of job [{}] failed (attempt {}/{}): {}",
                    item.position, item.job_id, attempt, RECORD_ATTEMPTS, e
                ),
            }
            if attempt < RECORD_ATTEMPTS {
                tokio::time::sleep(RECORD_BACKOFF * attempt).await;
            }
        }
        error!(
            "Task {} of job [{}] could not be accounted for",
            item.position, item.job_id
        );
    }
}

fn log_status(item: &WorkItem, status: JobStatus) {
    if status == JobStatus::Completed {
        info!("Job [{}] completed", item.job_id);
    }
}
