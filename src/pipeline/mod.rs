//! Crawl orchestration.
//!
//! - **Config**: layered, validated, immutable crawl settings
//! - **Runner**: discovery feeding a bounded worker pool, with one consumer
//!   writing accepted records and optional rejects
//! - **Progress**: shared counters and a periodic progress log
//!
//! # Flow
//!
//! 1. `SourceDiscovery` yields deduplicated candidates until the search budget is spent
//! 2. Each candidate is pinned and fetched by `RepositoryFetcher`
//! 3. The `FilterChain` runs keyword, maturity, syntax, structural and outlier stages
//! 4. Accepted snapshots become `DatasetRecord`s, appended to the output immediately
//!
//! Up to `workers` candidates are in flight at once. They share one
//! `RateLimiter` (inside the GitHub client) and one `CorpusStatistics`.

pub mod config;
pub mod progress;
pub mod runner;

pub use config::{ApiToken, CrawlConfig, PartialConfig};
pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot};
pub use runner::{CandidateOutcome, CrawlPipeline, RunSummary};
