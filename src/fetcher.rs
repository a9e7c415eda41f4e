use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info};

use crate::error::{Result, ScrapeError};
use crate::grammar::Task;

pub const DEFAULT_BASE_URL: &str = "https://www.conjugacao.com.br/verbo-";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Where conjugation pages come from. One call, one retrieval, no retries.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, task: &Task) -> Result<String>;
}

/// Live source backed by reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ScrapeError::Transport {
                url: base_url.to_string(),
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }

    pub fn page_url(&self, verb: &str) -> String {
        format!("{}{}/", self.base_url, verb)
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch(&self, task: &Task) -> Result<String> {
        let url = self.page_url(task.verb());
        info!("Fetching {}", url);

        let start = Instant::now();
        let transport = |e: reqwest::Error| ScrapeError::Transport {
            url: url.clone(),
            message: e.to_string(),
        };

        let response = self.client.get(&url).send().await.map_err(transport)?;
        let status = response.status();
        debug!(%status, latency_ms = start.elapsed().as_millis() as u64, "upstream responded");

        if let Some(message) = upstream_rejection(status) {
            return Err(ScrapeError::Upstream {
                verb: task.verb().to_string(),
                message,
            });
        }

        response.text().await.map_err(transport)
    }
}

fn upstream_rejection(status: StatusCode) -> Option<String> {
    match status {
        s if s.is_success() => None,
        StatusCode::NOT_FOUND | StatusCode::GONE => Some("verb not known upstream".to_string()),
        s => Some(format!("HTTP {}", s)),
    }
}
