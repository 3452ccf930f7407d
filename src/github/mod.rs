//! GitHub access layer.
//!
//! - [`rate_limit`]: shared quota tracking that gates every outbound call
//! - [`client`]: reqwest-backed REST client implementing [`GitHubApi`]
//! - [`search`]: paginated repository discovery with per-run deduplication
//! - [`fetcher`]: pins a candidate to a commit and downloads its files

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GithubError;

pub mod client;
pub mod fetcher;
pub mod rate_limit;
pub mod search;

pub use client::HttpGitHubClient;
pub use fetcher::{RepositoryFetcher, RepositorySnapshot, SnapshotFile};
pub use rate_limit::{ApiResource, RateLimiter};
pub use search::{DiscoveryParams, SourceDiscovery};

/// `owner/name` identity of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse a `owner/name` string.
    ///
    /// Both parts must be non-empty, contain only alphanumerics, `-`, `_`
    /// and `.`, and must not start with `.` or `-`.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if !is_valid_part(owner) || !is_valid_part(name) {
            return None;
        }
        Some(Self::new(owner, name))
    }

    /// Lowercased identity, used for deduplication (GitHub names are case-insensitive).
    pub fn dedup_key(&self) -> String {
        format!("{}/{}", self.owner, self.name).to_lowercase()
    }
}

fn is_valid_part(part: &str) -> bool {
    !part.is_empty()
        && part.len() <= 100
        && !part.starts_with('.')
        && !part.starts_with('-')
        && part
            .chars()
            .all(|ch| matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A repository returned by search, before any filter stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRepository {
    /// Numeric GitHub repository id.
    pub id: u64,
    pub repo: RepoId,
    pub html_url: String,
    pub stars: u64,
    pub forks: u64,
    /// Timestamp of the last push to any branch.
    pub pushed_at: DateTime<Utc>,
    pub default_branch: String,
    pub description: Option<String>,
    /// SPDX identifier, when GitHub detected a license.
    pub license: Option<String>,
}

/// One page of repository search results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub items: Vec<CandidateRepository>,
    /// Whether the API advertised a following page.
    pub has_next: bool,
    /// Items that were dropped because they could not be parsed.
    pub malformed: usize,
}

/// An entry of a recursive git tree listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    /// Blob object id (content address of the file at the pinned commit).
    pub sha: String,
    pub size: Option<u64>,
}

/// Blob entries of a recursive tree listing. Directories and submodules are omitted.
#[derive(Debug, Clone, Default)]
pub struct RepoTree {
    pub entries: Vec<TreeEntry>,
    pub truncated: bool,
}

/// The subset of the GitHub REST API the crawler needs.
///
/// Every implementation is expected to route its calls through a shared
/// [`RateLimiter`].
#[async_trait]
pub trait GitHubApi: Send + Sync {
    /// Run one page of `GET /search/repositories`.
    async fn search_repositories(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage, GithubError>;

    /// Resolve the commit SHA a branch currently points at.
    async fn resolve_commit(&self, repo: &RepoId, reference: &str) -> Result<String, GithubError>;

    /// List blobs of the tree at `commit`, recursively.
    async fn list_tree(&self, repo: &RepoId, commit: &str) -> Result<RepoTree, GithubError>;

    /// Download raw blob bytes.
    async fn fetch_blob(&self, repo: &RepoId, blob_sha: &str) -> Result<Vec<u8>, GithubError>;

    /// README text at `commit`, or `None` when the repository has none.
    async fn fetch_readme(&self, repo: &RepoId, commit: &str)
        -> Result<Option<String>, GithubError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_id_parses_owner_and_name() {
        let id = RepoId::parse("hashicorp/terraform-aws-vpc").unwrap();
        assert_eq!(id.owner, "hashicorp");
        assert_eq!(id.name, "terraform-aws-vpc");
        assert_eq!(id.to_string(), "hashicorp/terraform-aws-vpc");
    }

    #[test]
    fn repo_id_rejects_bad_names() {
        assert!(RepoId::parse("").is_none());
        assert!(RepoId::parse("noslash").is_none());
        assert!(RepoId::parse("a/b/c").is_none());
        assert!(RepoId::parse("owner/").is_none());
        assert!(RepoId::parse(".hidden/repo").is_none());
        assert!(RepoId::parse("owner/-flag").is_none());
        assert!(RepoId::parse("owner/repo;rm").is_none());
    }

    #[test]
    fn dedup_key_ignores_case() {
        let a = RepoId::new("Org", "Infra");
        let b = RepoId::new("org", "infra");
        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
