//! reqwest-backed GitHub REST client.
//!
//! Every request is charged against the shared [`RateLimiter`] before it is
//! sent, and every response feeds its `X-RateLimit-*` headers back into it.
//! Quota-exhausted responses suspend the caller until the advertised reset and
//! then repeat the request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::rate_limit::{seconds_until, ApiResource, RateLimiter, DEFAULT_EXHAUSTED_WAIT};
use super::{CandidateRepository, GitHubApi, RepoId, RepoTree, SearchPage, TreeEntry};
use crate::error::GithubError;

/// Public GitHub REST endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const USER_AGENT: &str = "iac-sieve/0.1";

/// Consecutive quota-exhausted responses tolerated for a single request.
const MAX_RATE_LIMIT_WAITS: u32 = 5;

/// GitHub's search API never returns results past this offset.
pub const SEARCH_RESULT_CAP: u32 = 1000;

pub struct HttpGitHubClient {
    client: Client,
    token: Option<String>,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

impl HttpGitHubClient {
    /// Create a client sharing `limiter` with every other GitHub caller.
    pub fn new(token: Option<String>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
            token,
            base_url: DEFAULT_API_BASE.to_string(),
            limiter,
        }
    }

    /// Point the client at a different API host (GitHub Enterprise).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Issue a GET and decode the JSON body.
    ///
    /// Returns `Ok(None)` for 404 and 409 (empty repository) responses.
    async fn get_json(
        &self,
        resource: ApiResource,
        path_and_query: &str,
    ) -> Result<Option<(Value, HeaderMap)>, GithubError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let mut waits = 0u32;

        loop {
            self.limiter.acquire(resource).await;

            let mut request = self
                .client
                .get(&url)
                .header("User-Agent", USER_AGENT)
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", "2022-11-28");
            if let Some(ref token) = self.token {
                request = request.header("Authorization", format!("Bearer {token}"));
            }

            let response = request
                .send()
                .await
                .map_err(|e| GithubError::Transient(format!("{path_and_query}: {e}")))?;

            let status = response.status();
            let headers = response.headers().clone();
            let observed = self.observe_quota(resource, &headers).await;

            if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
                let body = response.text().await.unwrap_or_default();
                if let Some(wait) = exhausted_wait(&headers, observed, &body) {
                    waits += 1;
                    if waits > MAX_RATE_LIMIT_WAITS {
                        return Err(GithubError::RateLimited { attempts: waits - 1 });
                    }
                    self.limiter.record_exhausted(resource, wait).await;
                    continue;
                }
                return Err(GithubError::Http {
                    status: status.as_u16(),
                    endpoint: path_and_query.to_string(),
                });
            }

            if status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT {
                return Ok(None);
            }

            if !status.is_success() {
                tracing::debug!(status = %status, endpoint = %path_and_query, "GitHub API error");
                return Err(GithubError::Http {
                    status: status.as_u16(),
                    endpoint: path_and_query.to_string(),
                });
            }

            let text = response
                .text()
                .await
                .map_err(|e| GithubError::Transient(format!("{path_and_query}: {e}")))?;
            let value: Value = serde_json::from_str(&text)
                .map_err(|e| GithubError::malformed(path_and_query, e.to_string()))?;
            return Ok(Some((value, headers)));
        }
    }

    /// Feed quota headers into the limiter. Returns the observed remaining count.
    async fn observe_quota(&self, requested: ApiResource, headers: &HeaderMap) -> Option<u64> {
        let remaining = header_u64(headers, "x-ratelimit-remaining")?;
        let reset = header_u64(headers, "x-ratelimit-reset").and_then(|v| i64::try_from(v).ok());
        let resource = headers
            .get("x-ratelimit-resource")
            .and_then(|v| v.to_str().ok())
            .and_then(ApiResource::from_header)
            .unwrap_or(requested);
        self.limiter.observe(resource, remaining, reset).await;
        Some(remaining)
    }

    fn repo_path(repo: &RepoId) -> String {
        format!(
            "/repos/{}/{}",
            urlencoding::encode(&repo.owner),
            urlencoding::encode(&repo.name)
        )
    }
}

#[async_trait]
impl GitHubApi for HttpGitHubClient {
    async fn search_repositories(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage, GithubError> {
        let path = format!(
            "/search/repositories?q={}&sort=stars&order=desc&per_page={}&page={}",
            urlencoding::encode(query),
            per_page,
            page
        );
        let Some((raw, headers)) = self.get_json(ApiResource::Search, &path).await? else {
            return Ok(SearchPage::default());
        };

        let items = raw
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| GithubError::malformed(&path, "missing 'items' array"))?;

        let mut page_result = parse_search_items(items);
        let link_next = headers
            .get("link")
            .and_then(|v| v.to_str().ok())
            .map(has_next_link);
        page_result.has_next = match link_next {
            Some(next) => next,
            None => items.len() as u32 >= per_page,
        };
        Ok(page_result)
    }

    async fn resolve_commit(&self, repo: &RepoId, reference: &str) -> Result<String, GithubError> {
        let path = format!(
            "{}/commits/{}",
            Self::repo_path(repo),
            urlencoding::encode(reference)
        );
        let (raw, _) = self
            .get_json(ApiResource::Core, &path)
            .await?
            .ok_or_else(|| GithubError::NotFound(format!("{repo}@{reference}")))?;
        let sha = raw
            .get("sha")
            .and_then(Value::as_str)
            .ok_or_else(|| GithubError::malformed(&path, "missing commit 'sha'"))?;
        if !is_commit_sha(sha) {
            return Err(GithubError::malformed(&path, format!("invalid commit sha '{sha}'")));
        }
        Ok(sha.to_string())
    }

    async fn list_tree(&self, repo: &RepoId, commit: &str) -> Result<RepoTree, GithubError> {
        let path = format!("{}/git/trees/{}?recursive=1", Self::repo_path(repo), commit);
        let (raw, _) = self
            .get_json(ApiResource::Core, &path)
            .await?
            .ok_or_else(|| GithubError::NotFound(format!("tree {repo}@{commit}")))?;
        parse_tree(&raw).ok_or_else(|| GithubError::malformed(&path, "missing 'tree' array"))
    }

    async fn fetch_blob(&self, repo: &RepoId, blob_sha: &str) -> Result<Vec<u8>, GithubError> {
        let path = format!("{}/git/blobs/{}", Self::repo_path(repo), blob_sha);
        let (raw, _) = self
            .get_json(ApiResource::Core, &path)
            .await?
            .ok_or_else(|| GithubError::NotFound(format!("blob {repo}:{blob_sha}")))?;
        decode_content(&raw).map_err(|message| GithubError::malformed(&path, message))
    }

    async fn fetch_readme(
        &self,
        repo: &RepoId,
        commit: &str,
    ) -> Result<Option<String>, GithubError> {
        let path = format!("{}/readme?ref={}", Self::repo_path(repo), commit);
        let Some((raw, _)) = self.get_json(ApiResource::Core, &path).await? else {
            return Ok(None);
        };
        let bytes = decode_content(&raw).map_err(|message| GithubError::malformed(&path, message))?;
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

/// How long to back off for a 403/429, or `None` when it is not a quota response.
fn exhausted_wait(headers: &HeaderMap, remaining: Option<u64>, body: &str) -> Option<Duration> {
    if let Some(retry_after) = header_u64(headers, "retry-after") {
        return Some(Duration::from_secs(retry_after));
    }
    let reset = header_u64(headers, "x-ratelimit-reset").and_then(|v| i64::try_from(v).ok());
    if remaining == Some(0) {
        return Some(reset.map(seconds_until).unwrap_or(DEFAULT_EXHAUSTED_WAIT));
    }
    if body.to_lowercase().contains("rate limit") {
        return Some(DEFAULT_EXHAUSTED_WAIT);
    }
    None
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Whether an RFC 8288 `Link` header advertises a `rel="next"` target.
fn has_next_link(link: &str) -> bool {
    link.split(',')
        .any(|part| part.split(';').skip(1).any(|p| p.trim() == "rel=\"next\""))
}

fn is_commit_sha(sha: &str) -> bool {
    sha.len() == 40 && sha.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse search items, counting the ones that could not be decoded.
pub(crate) fn parse_search_items(items: &[Value]) -> SearchPage {
    let mut page = SearchPage::default();
    for item in items {
        match parse_search_item(item) {
            Some(candidate) => page.items.push(candidate),
            None => {
                page.malformed += 1;
                tracing::warn!(
                    item = %truncate(&item.to_string(), 200),
                    "Dropping malformed search result"
                );
            }
        }
    }
    page
}

/// Parse a single `/search/repositories` item into a [`CandidateRepository`].
pub(crate) fn parse_search_item(item: &Value) -> Option<CandidateRepository> {
    let id = item.get("id").and_then(Value::as_u64)?;
    let repo = item
        .get("full_name")
        .and_then(Value::as_str)
        .and_then(RepoId::parse)?;
    let pushed_at = item
        .get("pushed_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))?;
    let html_url = item
        .get("html_url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("https://github.com/{repo}"));

    Some(CandidateRepository {
        id,
        repo,
        html_url,
        stars: item.get("stargazers_count").and_then(Value::as_u64).unwrap_or(0),
        forks: item.get("forks_count").and_then(Value::as_u64).unwrap_or(0),
        pushed_at,
        default_branch: item
            .get("default_branch")
            .and_then(Value::as_str)
            .unwrap_or("main")
            .to_string(),
        description: item
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        license: item
            .get("license")
            .and_then(|l| l.get("spdx_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

pub(crate) fn parse_tree(raw: &Value) -> Option<RepoTree> {
    let entries = raw.get("tree").and_then(Value::as_array)?;
    let truncated = raw.get("truncated").and_then(Value::as_bool).unwrap_or(false);
    let entries = entries
        .iter()
        .filter(|e| e.get("type").and_then(Value::as_str) == Some("blob"))
        .filter_map(|e| {
            Some(TreeEntry {
                path: e.get("path").and_then(Value::as_str)?.to_string(),
                sha: e.get("sha").and_then(Value::as_str)?.to_string(),
                size: e.get("size").and_then(Value::as_u64),
            })
        })
        .collect();
    Some(RepoTree { entries, truncated })
}

/// Decode the base64 `content` field of a blob or contents response.
pub(crate) fn decode_content(raw: &Value) -> Result<Vec<u8>, String> {
    let encoding = raw.get("encoding").and_then(Value::as_str).unwrap_or("base64");
    let content = raw
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing 'content'".to_string())?;
    match encoding {
        "base64" => {
            let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact.as_bytes())
                .map_err(|e| format!("invalid base64 content: {e}"))
        }
        "utf-8" | "utf8" => Ok(content.as_bytes().to_vec()),
        other => Err(format!("unsupported content encoding '{other}'")),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
