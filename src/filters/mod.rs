//! Ordered filter stages applied to every fetched snapshot.
//!
//! Stages run strictly in order and the chain stops at the first failure, so
//! a rejected candidate's [`FilterTrace`] ends with its failing stage and an
//! accepted candidate's trace lists every stage of the chain, all passed.

pub mod features;
pub mod hcl;
pub mod keyword;
pub mod maturity;
pub mod outlier;
pub mod structural;
pub mod syntax;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::github::RepositorySnapshot;

pub use features::FeatureVector;
pub use keyword::KeywordFilter;
pub use maturity::MaturityFilter;
pub use outlier::{CorpusStatistics, OutlierDetector, OutlierPolicy};
pub use structural::StructuralFilter;
pub use syntax::SyntaxValidator;

/// Names of the stages, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    KeywordExclusion,
    Maturity,
    SyntaxValidation,
    Structural,
    BehaviorOutlier,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::KeywordExclusion,
        StageName::Maturity,
        StageName::SyntaxValidation,
        StageName::Structural,
        StageName::BehaviorOutlier,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::KeywordExclusion => "keyword_exclusion",
            StageName::Maturity => "maturity",
            StageName::SyntaxValidation => "syntax_validation",
            StageName::Structural => "structural",
            StageName::BehaviorOutlier => "behavior_outlier",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable machine-readable rejection codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    FetchError,
    KeywordExcluded,
    MaturityFailed,
    SyntaxError,
    ValidationTimeout,
    ScratchIoError,
    StructuralFailed,
    BehaviorOutlier,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::FetchError => "fetch_error",
            RejectReason::KeywordExcluded => "keyword_excluded",
            RejectReason::MaturityFailed => "maturity_failed",
            RejectReason::SyntaxError => "syntax_error",
            RejectReason::ValidationTimeout => "validation_timeout",
            RejectReason::ScratchIoError => "scratch_io_error",
            RejectReason::StructuralFailed => "structural_failed",
            RejectReason::BehaviorOutlier => "behavior_outlier",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supporting value for a stage decision: a matched keyword or a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Evidence {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterStageResult {
    pub stage: StageName,
    pub passed: bool,
    /// Set on failure only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<RejectReason>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Evidence>,
}

impl FilterStageResult {
    pub fn pass(stage: StageName, reason: impl Into<String>) -> Self {
        Self {
            stage,
            passed: true,
            code: None,
            reason: reason.into(),
            evidence: None,
        }
    }

    pub fn fail(stage: StageName, code: RejectReason, reason: impl Into<String>) -> Self {
        Self {
            stage,
            passed: false,
            code: Some(code),
            reason: reason.into(),
            evidence: None,
        }
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = Some(evidence);
        self
    }
}

/// Results of the stages executed for one candidate, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterTrace(Vec<FilterStageResult>);

impl FilterTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: FilterStageResult) {
        self.0.push(result);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn results(&self) -> &[FilterStageResult] {
        &self.0
    }

    pub fn stages(&self) -> Vec<StageName> {
        self.0.iter().map(|r| r.stage).collect()
    }

    pub fn all_passed(&self) -> bool {
        self.0.iter().all(|r| r.passed)
    }

    pub fn first_failure(&self) -> Option<&FilterStageResult> {
        self.0.iter().find(|r| !r.passed)
    }

    /// Every stage of the full chain, in order, all passed.
    pub fn is_complete(&self) -> bool {
        self.stages() == StageName::ALL && self.all_passed()
    }
}

/// What a stage sees: the snapshot plus outputs of earlier stages.
pub struct StageContext<'a> {
    pub snapshot: &'a RepositorySnapshot,
    pub features: Option<FeatureVector>,
}

impl<'a> StageContext<'a> {
    pub fn new(snapshot: &'a RepositorySnapshot) -> Self {
        Self {
            snapshot,
            features: None,
        }
    }
}

#[async_trait]
pub trait FilterStage: Send + Sync {
    fn name(&self) -> StageName;

    async fn evaluate(&self, ctx: &mut StageContext<'_>) -> FilterStageResult;
}

/// Trace and derived outputs of one chain run.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub trace: FilterTrace,
    pub features: Option<FeatureVector>,
}

impl ChainOutcome {
    pub fn accepted(&self) -> bool {
        self.trace.is_complete()
    }

    pub fn rejection(&self) -> Option<&FilterStageResult> {
        self.trace.first_failure()
    }
}

pub struct FilterChain {
    stages: Vec<Box<dyn FilterStage>>,
}

impl FilterChain {
    pub fn new(stages: Vec<Box<dyn FilterStage>>) -> Self {
        Self { stages }
    }

    pub async fn run(&self, snapshot: &RepositorySnapshot) -> ChainOutcome {
        let mut ctx = StageContext::new(snapshot);
        let mut trace = FilterTrace::new();

        for stage in &self.stages {
            let result = stage.evaluate(&mut ctx).await;
            let passed = result.passed;
            if !passed {
                tracing::debug!(
                    repo = %snapshot.candidate.repo,
                    stage = %result.stage,
                    code = ?result.code,
                    reason = %result.reason,
                    "Candidate rejected"
                );
            }
            trace.push(result);
            if !passed {
                break;
            }
        }

        ChainOutcome {
            trace,
            features: ctx.features,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::github::{CandidateRepository, RepoId, SnapshotFile};
    use chrono::Utc;

    pub fn candidate(owner: &str, name: &str) -> CandidateRepository {
        CandidateRepository {
            id: 42,
            repo: RepoId::new(owner, name),
            html_url: format!("https://github.com/{owner}/{name}"),
            stars: 120,
            forks: 30,
            pushed_at: Utc::now(),
            default_branch: "main".to_string(),
            description: Some("Production landing zone".to_string()),
            license: Some("MIT".to_string()),
        }
    }

    pub fn snapshot(files: &[(&str, &str)]) -> RepositorySnapshot {
        RepositorySnapshot {
            candidate: candidate("acme", "infra"),
            commit_sha: "a".repeat(40),
            files: files
                .iter()
                .map(|(path, body)| SnapshotFile::from_bytes(*path, body.as_bytes().to_vec()))
                .collect(),
            readme: None,
            files_over_cap: 0,
        }
    }
}
