use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;
use crate::fetcher::PageSource;
use crate::grammar::Task;
use crate::parser::{self, PersonForms};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 1,
            delay: Duration::from_millis(500),
        }
    }
}

/// Fetch + normalize for a single task.
pub struct ScrapeExecutor {
    source: Arc<dyn PageSource>,
    retry: RetryPolicy,
}

impl ScrapeExecutor {
    pub fn new(source: Arc<dyn PageSource>, retry: RetryPolicy) -> Self {
        Self { source, retry }
    }

    pub async fn execute(&self, task: &Task) -> Result<PersonForms> {
        let html = self.fetch_with_retry(task).await?;
        parser::extract_conjugations(&html, task)
    }

    /// Only transport failures are retried; upstream answers are final.
    async fn fetch_with_retry(&self, task: &Task) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.source.fetch(task).await {
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    attempt += 1;
                    warn!(
                        "Transport failure on {} (attempt {}/{}), retrying in {:.1}s: {}",
                        task,
                        attempt,
                        self.retry.attempts,
                        self.retry.delay.as_secs_f64(),
                        e
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::ScrapeError;

    /// Fails with the given error `failures` times, then serves `html`.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        error: fn() -> ScrapeError,
        html: String,
    }

    #[async_trait]
    impl PageSource for Flaky {
        async fn fetch(&self, _task: &Task) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err((self.error)())
            } else {
                Ok(self.html.clone())
            }
        }
    }

    fn timeout() -> ScrapeError {
        ScrapeError::Transport {
            url: "http://upstream/".into(),
            message: "timed out".into(),
        }
    }

    fn not_found() -> ScrapeError {
        ScrapeError::Upstream {
            verb: "falar".into(),
            message: "verb not known upstream".into(),
        }
    }

    fn executor(failures: u32, error: fn() -> ScrapeError) -> (Arc<Flaky>, ScrapeExecutor) {
        let source = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            failures,
            error,
            html: std::fs::read_to_string("tests/fixtures/falar.html").unwrap(),
        });
        let retry = RetryPolicy {
            attempts: 1,
            delay: Duration::from_millis(1),
        };
        (source.clone(), ScrapeExecutor::new(source, retry))
    }

    fn task() -> Task {
        Task::new("falar", "Indicativo", "Presente").unwrap()
    }

    #[tokio::test]
    async fn one_transport_failure_is_retried() {
        let (source, exec) = executor(1, timeout);
        let forms = exec.execute(&task()).await.unwrap();
        assert_eq!(forms.as_slice()[0], "eu falo");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let (source, exec) = executor(5, timeout);
        let err = exec.execute(&task()).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn upstream_errors_fail_fast() {
        let (source, exec) = executor(5, not_found);
        let err = exec.execute(&task()).await.unwrap_err();
        assert_eq!(err.kind(), "upstream");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
