pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod grammar;
pub mod janitor;
pub mod manager;
pub mod parser;
pub mod store;

pub use engine::{BatchEngine, EngineConfig, JobSnapshot, Progress};
pub use error::{Result, ScrapeError};
pub use grammar::{Mode, Person, Task, TaskRequest};
pub use janitor::{Janitor, JanitorHandle, SweepReport};
pub use manager::{ScrapeSummary, VerbManager};
pub use store::Store;
