//! Repository discovery through the GitHub Search API.
//!
//! One search query is issued per keyword. Pages are requested in increasing
//! order until the search budget is spent, the API reports no further page,
//! or GitHub's 1000-result window is exhausted. Repositories matched by
//! several keywords are yielded only once per run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::Stream;

use super::client::SEARCH_RESULT_CAP;
use super::{CandidateRepository, GitHubApi};

/// Search results per page (GitHub maximum).
const MAX_PER_PAGE: u32 = 100;

/// Inputs for a discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryParams {
    /// One search query is issued per keyword.
    pub keywords: Vec<String>,
    /// Maximum number of distinct candidates to yield.
    pub budget: usize,
    pub min_stars: u64,
    pub min_forks: u64,
    pub max_age_months: u32,
    /// GitHub linguist language qualifier.
    pub language: String,
}

impl Default for DiscoveryParams {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            budget: 100,
            min_stars: 10,
            min_forks: 5,
            max_age_months: 24,
            language: "HCL".to_string(),
        }
    }
}

/// Lazy, finite, non-restartable source of candidates.
pub struct SourceDiscovery {
    api: Arc<dyn GitHubApi>,
    params: DiscoveryParams,
    considered: Arc<AtomicUsize>,
}

impl SourceDiscovery {
    pub fn new(api: Arc<dyn GitHubApi>, params: DiscoveryParams) -> Self {
        Self {
            api,
            params,
            considered: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Share an existing "candidates considered" counter (e.g. the progress counters).
    pub fn with_counter(mut self, considered: Arc<AtomicUsize>) -> Self {
        self.considered = considered;
        self
    }

    /// Counter of candidates yielded so far. Only ever increases.
    pub fn considered(&self) -> Arc<AtomicUsize> {
        self.considered.clone()
    }

    /// Build the search query for one keyword.
    ///
    /// Thresholds are pushed down as qualifiers so the API does the coarse
    /// filtering; the maturity stage still re-checks them exactly.
    pub fn build_query(keyword: &str, params: &DiscoveryParams, now: DateTime<Utc>) -> String {
        let mut parts = vec![keyword.trim().to_string()];
        if !params.language.is_empty() {
            parts.push(format!("language:{}", params.language));
        }
        if params.min_stars > 0 {
            parts.push(format!("stars:>={}", params.min_stars));
        }
        if params.min_forks > 0 {
            parts.push(format!("forks:>={}", params.min_forks));
        }
        let window_days = (i64::from(params.max_age_months) + 1) * 30;
        let cutoff = now - ChronoDuration::days(window_days);
        parts.push(format!("pushed:>={}", cutoff.format("%Y-%m-%d")));
        parts.join(" ")
    }

    /// Consume the discovery and return its candidate stream.
    pub fn into_stream(self) -> impl Stream<Item = CandidateRepository> + Send {
        let Self {
            api,
            params,
            considered,
        } = self;
        let per_page = u32::try_from(params.budget)
            .unwrap_or(MAX_PER_PAGE)
            .clamp(1, MAX_PER_PAGE);

        async_stream::stream! {
            let mut seen: HashSet<String> = HashSet::new();
            let now = Utc::now();

            'keywords: for keyword in &params.keywords {
                let query = Self::build_query(keyword, &params, now);
                tracing::info!(query = %query, "Starting repository search");
                let mut page = 1u32;

                loop {
                    if considered.load(Ordering::SeqCst) >= params.budget {
                        break 'keywords;
                    }
                    if (page - 1) * per_page >= SEARCH_RESULT_CAP {
                        tracing::debug!(query = %query, "Search result window exhausted");
                        break;
                    }

                    let result = match api.search_repositories(&query, page, per_page).await {
                        Ok(result) => result,
                        Err(err) => {
                            tracing::warn!(
                                query = %query,
                                page,
                                error = %err,
                                "Search page failed, moving to next keyword"
                            );
                            break;
                        }
                    };

                    tracing::debug!(
                        query = %query,
                        page,
                        items = result.items.len(),
                        malformed = result.malformed,
                        "Search page fetched"
                    );

                    for candidate in result.items {
                        if considered.load(Ordering::SeqCst) >= params.budget {
                            break 'keywords;
                        }
                        if !seen.insert(candidate.repo.dedup_key()) {
                            continue;
                        }
                        considered.fetch_add(1, Ordering::SeqCst);
                        yield candidate;
                    }

                    if !result.has_next {
                        break;
                    }
                    page += 1;
                }
            }

            tracing::info!(
                considered = considered.load(Ordering::SeqCst),
                budget = params.budget,
                "Repository discovery finished"
            );
        }
    }
}
