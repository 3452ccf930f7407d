//! Error types for iac-sieve operations.
//!
//! Defines error types for the major subsystems:
//! - Configuration resolution and validation
//! - GitHub API access (rate limits, transport, malformed payloads)
//! - Repository snapshot fetching
//! - External process execution
//! - Dataset output

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors detected while building the crawl configuration.
///
/// Always fatal: they are raised before any network call is made.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Validation tool '{0}' not found on PATH (install it or pass --dry-run)")]
    ToolNotFound(String),

    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Errors returned by the GitHub API layer.
#[derive(Debug, Error)]
pub enum GithubError {
    /// Quota stayed exhausted after repeated waits for the advertised reset.
    #[error("GitHub rate limit still exhausted after {attempts} waits")]
    RateLimited { attempts: u32 },

    /// Network failure or unreachable API.
    #[error("GitHub API request failed: {0}")]
    Transient(String),

    #[error("GitHub resource not found: {0}")]
    NotFound(String),

    #[error("Malformed GitHub API response from {endpoint}: {message}")]
    Malformed { endpoint: String, message: String },

    #[error("GitHub API returned HTTP {status} for {endpoint}")]
    Http { status: u16, endpoint: String },
}

impl GithubError {
    pub(crate) fn malformed(endpoint: &str, message: impl Into<String>) -> Self {
        Self::Malformed {
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }
}

/// Errors that abort a single repository fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Github(#[from] GithubError),

    #[error("Recursive tree for {repo} at {commit} is truncated")]
    TreeTruncated { repo: String, commit: String },

    #[error("Invalid file path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Errors raised while running an external process.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process '{program}' timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("IO error while waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors on the dataset output streams. Fatal to the whole run.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Failed to open output '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Record violates dataset schema: {0}")]
    Schema(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
