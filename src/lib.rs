//! iac-sieve: crawl-and-filter pipeline for Terraform datasets.
//!
//! Discovers Terraform repositories on GitHub, pins each to a commit, runs
//! it through an ordered filter chain and appends accepted snapshots to an
//! NDJSON dataset with full provenance.

pub mod cli;
pub mod error;
pub mod execution;
pub mod export;
pub mod filters;
pub mod github;
pub mod pipeline;

pub use error::{ConfigError, FetchError, GithubError, OutputError, ProcessError};
