use tracing::{debug, info, warn};

use crate::error::Result;
use crate::executor::ScrapeExecutor;
use crate::grammar::Task;
use crate::store::Store;

/// What a successful single scrape wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeSummary {
    pub task: Task,
    pub rows_written: usize,
}

/// Scrape → persist for one (verb, mode, tense). Either all six rows land or
/// nothing does.
pub struct VerbManager {
    executor: ScrapeExecutor,
    store: Store,
}

impl VerbManager {
    pub fn new(executor: ScrapeExecutor, store: Store) -> Self {
        Self { executor, store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Validates the raw strings, then runs the task.
    pub async fn scrape_one(&self, verb: &str, mode: &str, tense: &str) -> Result<ScrapeSummary> {
        let task = Task::new(verb, mode, tense)?;
        self.run_task(task).await
    }

    pub async fn run_task(&self, task: Task) -> Result<ScrapeSummary> {
        debug!("Starting scrape for {}", task);
        let forms = match self.executor.execute(&task).await {
            Ok(forms) => forms,
            Err(e) => {
                warn!("Scrape failed for {}: {}", task, e);
                return Err(e);
            }
        };

        let rows_written = self
            .store
            .upsert_conjugations(task.clone(), forms)
            .await
            .inspect_err(|e| warn!("Persisting {} failed: {}", task, e))?;

        info!("Persisted {} ({} rows)", task, rows_written);
        Ok(ScrapeSummary { task, rows_written })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{manager, StaticSource};
    use crate::grammar::Mode;
    use crate::store::testing::TempDb;

    #[tokio::test]
    async fn falar_scenario_persists_six_rows() {
        let db = TempDb::new();
        let m = manager(StaticSource::with_fixtures(&["falar"]), db.store.clone());

        let summary = m.scrape_one("falar", "Indicativo", "Presente").await.unwrap();
        assert_eq!(summary.rows_written, 6);

        let rows = db.store.conjugations("falar", Mode::Indicativo, "Presente").await.unwrap();
        let pairs: Vec<(&str, &str)> = rows.iter().map(|r| (r.person.as_str(), r.value.as_str())).collect();
        assert_eq!(
            pairs,
            [
                ("eu", "eu falo"),
                ("tu", "tu falas"),
                ("ele", "ele fala"),
                ("nós", "nós falamos"),
                ("vós", "vós falais"),
                ("eles", "eles falam"),
            ]
        );
    }

    #[tokio::test]
    async fn rescrape_is_idempotent() {
        let db = TempDb::new();
        let m = manager(StaticSource::with_fixtures(&["falar", "ir"]), db.store.clone());
        m.scrape_one("falar", "Indicativo", "Presente").await.unwrap();
        m.scrape_one("falar", "Indicativo", "Presente").await.unwrap();
        m.scrape_one("ir", "Indicativo", "Presente").await.unwrap();

        let stats = db.store.stats().await.unwrap();
        assert_eq!(stats.verbs, 2);
        assert_eq!(stats.conjugations, 12);
    }

    #[tokio::test]
    async fn validation_happens_before_fetch() {
        let db = TempDb::new();
        let m = manager(StaticSource::with_fixtures(&[]), db.store.clone());
        let err = m.scrape_one("fa/lar", "Indicativo", "Presente").await.unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = m.scrape_one("falar", "Condicional", "Presente").await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn failures_write_nothing() {
        let db = TempDb::new();
        let broken = StaticSource::with_fixtures(&[]).alias("quebrar", "duplicate_headers");
        let m = manager(broken, db.store.clone());

        let err = m.scrape_one("xnotaverb", "Indicativo", "Presente").await.unwrap_err();
        assert_eq!(err.kind(), "upstream");
        // The page has no Futuro table at all.
        let err = m.scrape_one("quebrar", "Subjuntivo", "Futuro").await.unwrap_err();
        assert_eq!(err.kind(), "extraction");

        assert!(!db.store.verb_exists("xnotaverb").await.unwrap());
        assert!(!db.store.verb_exists("quebrar").await.unwrap());
    }
}
