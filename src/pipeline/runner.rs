//! The crawl loop: discovery, a bounded pool of per-candidate workers, and a
//! single consumer that owns the output streams.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::Serialize;
use uuid::Uuid;

use super::config::CrawlConfig;
use super::progress::{ProgressCounters, ProgressMonitor};
use crate::error::OutputError;
use crate::execution::CommandRunner;
use crate::export::{DatasetRecord, DatasetWriter, NdjsonWriter, ProvenanceRecorder, RejectRecord};
use crate::filters::maturity::MaturityThresholds;
use crate::filters::outlier::SharedStatistics;
use crate::filters::structural::StructuralConfig;
use crate::filters::syntax::SyntaxConfig;
use crate::filters::{
    CorpusStatistics, FilterChain, FilterTrace, KeywordFilter, MaturityFilter, OutlierDetector,
    OutlierPolicy, RejectReason, StructuralFilter, SyntaxValidator,
};
use crate::github::fetcher::FetcherConfig;
use crate::github::{
    CandidateRepository, DiscoveryParams, GitHubApi, RepositoryFetcher, SourceDiscovery,
};

/// Result of processing one candidate.
#[derive(Debug, Clone)]
pub enum CandidateOutcome {
    Accepted(Box<DatasetRecord>),
    Rejected(Box<RejectRecord>),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub considered: usize,
    pub fetched: usize,
    pub accepted: usize,
    /// Rejections keyed by reason code.
    pub rejected: BTreeMap<String, usize>,
    pub output: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejects: Option<PathBuf>,
    pub dry_run: bool,
    /// The crawl stopped because `target_accepted` was reached.
    pub target_reached: bool,
    pub elapsed_secs: f64,
}

pub struct CrawlPipeline {
    config: Arc<CrawlConfig>,
    api: Arc<dyn GitHubApi>,
    runner: Arc<dyn CommandRunner>,
    stats: SharedStatistics,
    recorder: ProvenanceRecorder,
    counters: ProgressCounters,
}

impl CrawlPipeline {
    pub fn new(
        config: CrawlConfig,
        api: Arc<dyn GitHubApi>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            api,
            runner,
            stats: CorpusStatistics::shared(),
            recorder: ProvenanceRecorder::new(),
            counters: ProgressCounters::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.recorder = ProvenanceRecorder::with_run_id(run_id);
        self
    }

    pub fn statistics(&self) -> SharedStatistics {
        self.stats.clone()
    }

    /// Keyword -> Maturity -> Syntax -> Structural -> Outlier.
    pub fn build_chain(&self) -> FilterChain {
        let c = &self.config;
        FilterChain::new(vec![
            Box::new(KeywordFilter::new(&c.forbidden_keywords)),
            Box::new(MaturityFilter::new(MaturityThresholds {
                min_stars: c.min_stars,
                min_forks: c.min_forks,
                max_age_months: c.max_age_months,
                require_readme: c.require_readme,
            })),
            Box::new(SyntaxValidator::new(
                SyntaxConfig {
                    terraform_bin: c.terraform_bin.clone(),
                    timeout: c.validation_timeout,
                    dry_run: c.dry_run,
                    scratch_root: c.scratch_root.clone(),
                    plugin_cache_dir: c.plugin_cache_dir.clone(),
                },
                self.runner.clone(),
            )),
            Box::new(StructuralFilter::new(StructuralConfig {
                min_resources: c.min_resources,
                required_provider: c.required_provider.clone(),
            })),
            Box::new(OutlierDetector::new(
                OutlierPolicy {
                    tolerance: c.outlier_tolerance,
                    min_samples: c.outlier_min_samples,
                    min_stddev: c.outlier_min_stddev,
                    monitored: c.monitored_features.clone(),
                },
                self.stats.clone(),
            )),
        ])
    }

    fn fetcher(&self) -> RepositoryFetcher {
        RepositoryFetcher::new(
            self.api.clone(),
            FetcherConfig {
                max_files: self.config.max_files,
                extensions: self.config.extensions.clone(),
                fetch_readme: true,
            },
        )
    }

    fn discovery(&self) -> SourceDiscovery {
        let c = &self.config;
        SourceDiscovery::new(
            self.api.clone(),
            DiscoveryParams {
                keywords: c.keywords.clone(),
                budget: c.search_budget,
                min_stars: c.min_stars,
                min_forks: c.min_forks,
                max_age_months: c.max_age_months,
                ..DiscoveryParams::default()
            },
        )
        .with_counter(self.counters.considered.clone())
    }

    /// Fetch one candidate and run it through the chain.
    pub async fn process(
        &self,
        chain: &FilterChain,
        fetcher: &RepositoryFetcher,
        candidate: CandidateRepository,
    ) -> Result<CandidateOutcome, OutputError> {
        let snapshot = match fetcher.fetch(candidate.clone()).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(
                    repo = %candidate.repo,
                    error = %err,
                    "Fetch failed, rejecting candidate"
                );
                self.counters.fetch_failed.fetch_add(1, Ordering::Relaxed);
                return Ok(CandidateOutcome::Rejected(Box::new(self.recorder.reject(
                    &candidate,
                    None,
                    RejectReason::FetchError,
                    err.to_string(),
                    FilterTrace::new(),
                ))));
            }
        };
        self.counters.fetched.fetch_add(1, Ordering::Relaxed);

        let outcome = chain.run(&snapshot).await;
        if let Some(failure) = outcome.rejection() {
            self.counters.record_rejection(failure.stage);
            let code = failure.code.unwrap_or(RejectReason::StructuralFailed);
            let reason = failure.reason.clone();
            return Ok(CandidateOutcome::Rejected(Box::new(self.recorder.reject(
                &candidate,
                Some(&snapshot.commit_sha),
                code,
                reason,
                outcome.trace,
            ))));
        }

        let features = outcome.features.unwrap_or_default();
        let record = self.recorder.record(&snapshot, features, outcome.trace)?;
        Ok(CandidateOutcome::Accepted(Box::new(record)))
    }

    /// Crawl until the search budget is spent or the target count is reached.
    pub async fn run(&self) -> Result<RunSummary, OutputError> {
        let start = Instant::now();
        let c = &self.config;
        let writer = DatasetWriter::open(&c.output).await?;
        let rejects = match &c.rejects {
            Some(path) => Some(NdjsonWriter::open(path).await?),
            None => None,
        };

        tracing::info!(
            run_id = %self.recorder.run_id(),
            keywords = ?c.keywords,
            budget = c.search_budget,
            workers = c.workers,
            dry_run = c.dry_run,
            output = %c.output.display(),
            "Starting crawl"
        );

        let monitor =
            ProgressMonitor::start(self.counters.clone(), c.search_budget, c.progress_interval);
        let chain = self.build_chain();
        let fetcher = self.fetcher();
        let mut rejected: BTreeMap<String, usize> = BTreeMap::new();
        let mut accepted = 0usize;
        let mut target_reached = false;

        let mut outcomes = Box::pin(
            self.discovery()
                .into_stream()
                .map(|candidate| self.process(&chain, &fetcher, candidate))
                .buffer_unordered(c.workers),
        );

        while let Some(outcome) = outcomes.next().await {
            match outcome? {
                CandidateOutcome::Accepted(record) => {
                    writer.write(&record).await?;
                    accepted += 1;
                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        repo = %record.repo_full_name,
                        sample_id = %record.sample_id,
                        files = record.terraform_files.len(),
                        accepted,
                        "Accepted candidate"
                    );
                    if c.target_accepted.is_some_and(|target| accepted >= target) {
                        tracing::info!(accepted, "Target accepted count reached, stopping crawl");
                        target_reached = true;
                        break;
                    }
                }
                CandidateOutcome::Rejected(reject) => {
                    *rejected.entry(reject.code.as_str().to_string()).or_default() += 1;
                    if let Some(rejects) = &rejects {
                        rejects.append(&reject).await?;
                    }
                }
            }
        }
        // Cancels in-flight candidates when stopping early.
        drop(outcomes);

        let snap = monitor.stop().await;
        Ok(RunSummary {
            run_id: self.recorder.run_id(),
            considered: snap.considered,
            fetched: snap.fetched,
            accepted,
            rejected,
            output: c.output.clone(),
            rejects: c.rejects.clone(),
            dry_run: c.dry_run,
            target_reached,
            elapsed_secs: start.elapsed().as_secs_f64(),
        })
    }
}
