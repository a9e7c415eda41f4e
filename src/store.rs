use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tracing::info;

use crate::db::{self, ConjugationRow, JobRow, JobStatus, Stats, TaskOutcome, TaskRow};
use crate::error::{Result, ScrapeError};
use crate::grammar::{Mode, Task};
use crate::parser::PersonForms;

/// Handle to the SQLite file shared by every worker.
///
/// Each call opens its own connection on the blocking pool, so callers never
/// share a lock in this process; SQLite's own write lock is the only point
/// where writers meet.
#[derive(Clone)]
pub struct Store {
    path: Arc<PathBuf>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Store> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                ScrapeError::Persistence(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        let conn = db::connect(&path)?;
        db::init_schema(&conn)?;
        info!("Database ready at {}", path.display());
        Ok(Store {
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connect(&self) -> Result<Connection> {
        db::connect(&self.path)
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || {
            let mut conn = db::connect(&path)?;
            f(&mut conn)
        })
        .await?
    }

    pub async fn upsert_conjugations(&self, task: Task, forms: PersonForms) -> Result<usize> {
        self.run(move |c| db::upsert_conjugations(c, &task, &forms)).await
    }

    pub async fn conjugations(&self, verb: &str, mode: Mode, tense: &str) -> Result<Vec<ConjugationRow>> {
        let (verb, tense) = (verb.to_string(), tense.to_string());
        self.run(move |c| db::fetch_conjugations(c, &verb, mode, &tense)).await
    }

    pub async fn verb_conjugations(&self, verb: &str) -> Result<Vec<ConjugationRow>> {
        let verb = verb.to_string();
        self.run(move |c| db::fetch_verb_conjugations(c, &verb)).await
    }

    pub async fn verb_exists(&self, verb: &str) -> Result<bool> {
        let verb = verb.to_string();
        self.run(move |c| db::verb_exists(c, &verb)).await
    }

    pub async fn insert_job(&self, job_id: &str, tasks: Vec<Task>) -> Result<JobStatus> {
        let job_id = job_id.to_string();
        self.run(move |c| db::insert_job(c, &job_id, &tasks)).await
    }

    pub async fn mark_processing(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        self.run(move |c| db::mark_processing(c, &job_id)).await
    }

    pub async fn record_task_outcome(
        &self,
        job_id: &str,
        position: u32,
        outcome: TaskOutcome,
    ) -> Result<JobStatus> {
        let job_id = job_id.to_string();
        self.run(move |c| db::record_task_outcome(c, &job_id, position, &outcome))
            .await
    }

    pub async fn abandon_task(&self, job_id: &str, position: u32, detail: String) -> Result<JobStatus> {
        let job_id = job_id.to_string();
        self.run(move |c| db::abandon_task(c, &job_id, position, &detail)).await
    }

    pub async fn fetch_job(&self, job_id: &str) -> Result<Option<(JobRow, Vec<TaskRow>)>> {
        let job_id = job_id.to_string();
        self.run(move |c| db::fetch_job(c, &job_id)).await
    }

    pub async fn expired_job_ids(&self, cutoff: String) -> Result<Vec<String>> {
        self.run(move |c| db::expired_job_ids(c, &cutoff)).await
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        self.run(move |c| db::delete_job(c, &job_id)).await
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.run(|c| db::get_stats(c)).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TempDb;
    use super::*;
    use crate::grammar::Person;

    fn forms(verb: &str) -> PersonForms {
        Person::ALL
            .iter()
            .map(|p| format!("{} {}", p.name(), verb))
            .collect::<Vec<_>>()
            .try_into()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_key_writes_serialize() {
        let db = TempDb::new();
        let task = Task::new("falar", "Indicativo", "Presente").unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = db.store.clone();
            let task = task.clone();
            handles.push(tokio::spawn(async move {
                store.upsert_conjugations(task, forms(&format!("v{}", i))).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let rows = db.store.conjugations("falar", Mode::Indicativo, "Presente").await.unwrap();
        assert_eq!(rows.len(), 6);
        // Every row comes from one complete write, whichever landed last.
        let suffix = rows[0].value.rsplit(' ').next().unwrap().to_string();
        assert!(rows.iter().all(|r| r.value.ends_with(&suffix)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_distinct_keys() {
        let db = TempDb::new();
        let verbs = ["falar", "comer", "partir", "ir", "ser", "estar"];
        let mut handles = Vec::new();
        for verb in verbs {
            let store = db.store.clone();
            handles.push(tokio::spawn(async move {
                let task = Task::new(verb, "Indicativo", "Presente").unwrap();
                store.upsert_conjugations(task, forms(verb)).await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 6);
        }
        let stats = db.store.stats().await.unwrap();
        assert_eq!(stats.verbs, verbs.len());
        assert_eq!(stats.conjugations, verbs.len() * 6);
    }
}
