//! Pins a candidate to an immutable commit and downloads its target-language files.
//!
//! The head of the default branch is resolved exactly once per candidate.
//! The tree listing, every blob download and every digest are computed at
//! that commit, so re-running [`RepositoryFetcher::fetch_at`] with the same
//! commit reproduces the same hashes.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{CandidateRepository, GitHubApi, TreeEntry};
use crate::error::FetchError;

/// Concurrent blob downloads per candidate.
const BLOB_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Files kept per candidate; later files (in path order) are ignored.
    pub max_files: usize,
    /// File suffixes belonging to the target language.
    pub extensions: Vec<String>,
    pub fetch_readme: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_files: 200,
            extensions: vec![".tf".to_string()],
            fetch_readme: true,
        }
    }
}

/// A fetched file at the pinned commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotFile {
    pub path: String,
    #[serde(skip)]
    pub content: String,
    /// Hex SHA-256 of the raw bytes.
    pub sha256: String,
    pub size_bytes: u64,
    /// `false` when the raw bytes were not valid UTF-8 (content is then lossy).
    #[serde(skip)]
    pub utf8_valid: bool,
}

impl SnapshotFile {
    pub fn from_bytes(path: impl Into<String>, bytes: Vec<u8>) -> Self {
        let sha256 = sha256_hex(&bytes);
        let size_bytes = bytes.len() as u64;
        let (content, utf8_valid) = match String::from_utf8(bytes) {
            Ok(text) => (text, true),
            Err(err) => (String::from_utf8_lossy(err.as_bytes()).into_owned(), false),
        };
        Self {
            path: path.into(),
            content,
            sha256,
            size_bytes,
            utf8_valid,
        }
    }
}

/// Candidate pinned to a commit, with its files in path order.
#[derive(Debug, Clone)]
pub struct RepositorySnapshot {
    pub candidate: CandidateRepository,
    pub commit_sha: String,
    pub files: Vec<SnapshotFile>,
    pub readme: Option<String>,
    /// Matching files dropped by the per-candidate cap.
    pub files_over_cap: usize,
}

pub struct RepositoryFetcher {
    api: Arc<dyn GitHubApi>,
    config: FetcherConfig,
}

impl RepositoryFetcher {
    pub fn new(api: Arc<dyn GitHubApi>, config: FetcherConfig) -> Self {
        Self { api, config }
    }

    /// Resolve the default branch head and fetch the snapshot at that commit.
    pub async fn fetch(
        &self,
        candidate: CandidateRepository,
    ) -> Result<RepositorySnapshot, FetchError> {
        let commit = self
            .api
            .resolve_commit(&candidate.repo, &candidate.default_branch)
            .await?;
        tracing::debug!(repo = %candidate.repo, commit = %commit, "Pinned commit");
        self.fetch_at(candidate, commit).await
    }

    /// Fetch the snapshot at an already pinned commit.
    pub async fn fetch_at(
        &self,
        candidate: CandidateRepository,
        commit_sha: String,
    ) -> Result<RepositorySnapshot, FetchError> {
        let tree = self.api.list_tree(&candidate.repo, &commit_sha).await?;
        if tree.truncated {
            return Err(FetchError::TreeTruncated {
                repo: candidate.repo.to_string(),
                commit: commit_sha,
            });
        }

        let (selected, files_over_cap) = self.select_entries(tree.entries);
        if files_over_cap > 0 {
            tracing::debug!(
                repo = %candidate.repo,
                kept = selected.len(),
                ignored = files_over_cap,
                "File cap reached"
            );
        }

        let api = &self.api;
        let repo = &candidate.repo;
        let files: Vec<SnapshotFile> = futures::stream::iter(selected)
            .map(|entry| async move {
                let bytes = api.fetch_blob(repo, &entry.sha).await?;
                Ok::<_, FetchError>(SnapshotFile::from_bytes(entry.path, bytes))
            })
            .buffered(BLOB_CONCURRENCY)
            .try_collect()
            .await?;

        let readme = if self.config.fetch_readme {
            self.api.fetch_readme(&candidate.repo, &commit_sha).await?
        } else {
            None
        };

        Ok(RepositorySnapshot {
            candidate,
            commit_sha,
            files,
            readme,
            files_over_cap,
        })
    }

    /// Keep target-language blobs with safe paths, sorted by path, up to the cap.
    fn select_entries(&self, entries: Vec<TreeEntry>) -> (Vec<TreeEntry>, usize) {
        let mut matching: Vec<TreeEntry> = entries
            .into_iter()
            .filter(|e| self.config.extensions.iter().any(|ext| e.path.ends_with(ext.as_str())))
            .filter(|e| match validate_file_path(&e.path) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(path = %e.path, error = %err, "Skipping file with unsafe path");
                    false
                }
            })
            .collect();
        matching.sort_by(|a, b| a.path.cmp(&b.path));
        let over = matching.len().saturating_sub(self.config.max_files);
        matching.truncate(self.config.max_files);
        (matching, over)
    }
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Validate a repository-relative path before it is materialized on disk.
///
/// Rejects empty and absolute paths, `..` components, NUL bytes and
/// backslashes.
pub fn validate_file_path(path: &str) -> Result<(), FetchError> {
    let invalid = |reason: &str| FetchError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.len() > 4096 {
        return Err(invalid("path too long"));
    }
    if path.contains('\0') {
        return Err(invalid("contains NUL byte"));
    }
    if path.contains('\\') {
        return Err(invalid("contains backslash"));
    }
    if path.starts_with('/') {
        return Err(invalid("absolute path"));
    }
    if path.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(invalid("empty or parent-directory component"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GithubError;
    use crate::github::{RepoId, RepoTree, SearchPage};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

    struct TreeApi {
        tree: RepoTree,
        blobs: HashMap<String, Vec<u8>>,
        resolves: AtomicUsize,
    }

    #[async_trait]
    impl GitHubApi for TreeApi {
        async fn search_repositories(
            &self,
            _: &str,
            _: u32,
            _: u32,
        ) -> Result<SearchPage, GithubError> {
            unreachable!()
        }
        async fn resolve_commit(&self, _: &RepoId, _: &str) -> Result<String, GithubError> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(COMMIT.to_string())
        }
        async fn list_tree(&self, _: &RepoId, commit: &str) -> Result<RepoTree, GithubError> {
            assert_eq!(commit, COMMIT);
            Ok(self.tree.clone())
        }
        async fn fetch_blob(&self, _: &RepoId, sha: &str) -> Result<Vec<u8>, GithubError> {
            self.blobs
                .get(sha)
                .cloned()
                .ok_or_else(|| GithubError::NotFound(sha.to_string()))
        }
        async fn fetch_readme(&self, _: &RepoId, _: &str) -> Result<Option<String>, GithubError> {
            Ok(Some("# Network modules".to_string()))
        }
    }

    fn entry(path: &str, sha: &str) -> TreeEntry {
        TreeEntry {
            path: path.to_string(),
            sha: sha.to_string(),
            size: None,
        }
    }

    fn candidate() -> CandidateRepository {
        CandidateRepository {
            id: 7,
            repo: RepoId::new("acme", "net"),
            html_url: "https://github.com/acme/net".to_string(),
            stars: 10,
            forks: 5,
            pushed_at: Utc::now(),
            default_branch: "main".to_string(),
            description: None,
            license: None,
        }
    }

    fn api(entries: Vec<TreeEntry>, truncated: bool) -> Arc<TreeApi> {
        let mut blobs = HashMap::new();
        blobs.insert("b1".to_string(), b"resource \"aws_vpc\" \"main\" {}\n".to_vec());
        blobs.insert("b2".to_string(), b"variable \"cidr\" {}\n".to_vec());
        blobs.insert("b3".to_string(), b"output \"id\" {}\n".to_vec());
        Arc::new(TreeApi {
            tree: RepoTree { entries, truncated },
            blobs,
            resolves: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn fetch_filters_by_extension_and_sorts() {
        let api = api(
            vec![
                entry("variables.tf", "b2"),
                entry("README.md", "b3"),
                entry("main.tf", "b1"),
            ],
            false,
        );
        let fetcher = RepositoryFetcher::new(api.clone(), FetcherConfig::default());
        let snapshot = fetcher.fetch(candidate()).await.unwrap();

        assert_eq!(snapshot.commit_sha, COMMIT);
        let paths: Vec<_> = snapshot.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["main.tf", "variables.tf"]);
        assert_eq!(snapshot.readme.as_deref(), Some("# Network modules"));
        assert_eq!(api.resolves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn files_beyond_cap_are_ignored() {
        let api = api(
            vec![entry("a.tf", "b1"), entry("b.tf", "b2"), entry("c.tf", "b3")],
            false,
        );
        let config = FetcherConfig {
            max_files: 2,
            ..FetcherConfig::default()
        };
        let snapshot = RepositoryFetcher::new(api, config)
            .fetch(candidate())
            .await
            .unwrap();
        assert_eq!(snapshot.files.len(), 2);
        assert_eq!(snapshot.files_over_cap, 1);
    }

    #[tokio::test]
    async fn refetch_at_pinned_commit_reproduces_hashes() {
        let api = api(vec![entry("main.tf", "b1"), entry("vars.tf", "b2")], false);
        let fetcher = RepositoryFetcher::new(api.clone(), FetcherConfig::default());

        let first = fetcher.fetch(candidate()).await.unwrap();
        let again = fetcher
            .fetch_at(candidate(), first.commit_sha.clone())
            .await
            .unwrap();

        let hashes = |s: &RepositorySnapshot| {
            s.files
                .iter()
                .map(|f| (f.path.clone(), f.sha256.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(hashes(&first), hashes(&again));
        assert_eq!(api.resolves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn truncated_tree_is_a_fetch_error() {
        let api = api(vec![entry("main.tf", "b1")], true);
        let err = RepositoryFetcher::new(api, FetcherConfig::default())
            .fetch(candidate())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TreeTruncated { .. }));
    }

    #[tokio::test]
    async fn missing_blob_is_a_fetch_error() {
        let api = api(vec![entry("main.tf", "missing")], false);
        let err = RepositoryFetcher::new(api, FetcherConfig::default())
            .fetch(candidate())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Github(GithubError::NotFound(_))));
    }

    #[tokio::test]
    async fn unsafe_paths_are_skipped() {
        let api = api(vec![entry("../escape.tf", "b1"), entry("ok.tf", "b2")], false);
        let snapshot = RepositoryFetcher::new(api, FetcherConfig::default())
            .fetch(candidate())
            .await
            .unwrap();
        assert_eq!(snapshot.files.len(), 1);
        assert_eq!(snapshot.files[0].path, "ok.tf");
    }

    #[test]
    fn snapshot_file_hash_is_sha256_of_raw_bytes() {
        let file = SnapshotFile::from_bytes("main.tf", b"abc".to_vec());
        assert_eq!(
            file.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(file.size_bytes, 3);
        assert!(file.utf8_valid);
    }

    #[test]
    fn invalid_utf8_is_flagged() {
        let file = SnapshotFile::from_bytes("bin.tf", vec![0xff, 0xfe, 0x00]);
        assert!(!file.utf8_valid);
    }

    #[test]
    fn validate_file_path_cases() {
        assert!(validate_file_path("modules/vpc/main.tf").is_ok());
        assert!(validate_file_path("").is_err());
        assert!(validate_file_path("/etc/passwd").is_err());
        assert!(validate_file_path("a/../../b.tf").is_err());
        assert!(validate_file_path("a//b.tf").is_err());
        assert!(validate_file_path("a\\b.tf").is_err());
        assert!(validate_file_path("a\0.tf").is_err());
    }
}
