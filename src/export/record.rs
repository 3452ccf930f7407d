//! Persisted record shapes and the schema every emitted line must satisfy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OutputError;
use crate::filters::{FeatureVector, FilterTrace, RejectReason, StageName};
use crate::github::fetcher::sha256_hex;
use crate::github::{CandidateRepository, RepositorySnapshot};

pub const SCHEMA_VERSION: u32 = 1;
pub const SOURCE: &str = "github";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedFile {
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub schema_version: u32,
    /// `<repo_id>:<first 12 chars of commit>`.
    pub sample_id: String,
    pub repo_id: u64,
    pub repo_full_name: String,
    pub repo_url: String,
    pub description: Option<String>,
    pub stars: u64,
    pub forks: u64,
    /// Last push as reported by search, not the pinned commit's date.
    pub pushed_at: DateTime<Utc>,
    pub default_branch: String,
    /// SPDX identifier when GitHub detected one.
    pub license: Option<String>,
    /// Full 40-char SHA the snapshot was pinned to.
    pub commit_sha: String,
    pub crawl_timestamp: DateTime<Utc>,
    /// Shared by every record written in one run.
    pub crawl_run_id: Uuid,
    /// Always `github`.
    pub source: String,
    pub terraform_files: Vec<RecordedFile>,
    /// SHA-256 over the ordered `path\0sha256` manifest of `terraform_files`.
    pub content_digest: String,
    pub feature_vector: FeatureVector,
    /// One entry per stage, in chain order.
    pub filter_trace: FilterTrace,
}

impl DatasetRecord {
    /// Structural invariants downstream consumers rely on.
    pub fn validate(&self) -> Result<(), OutputError> {
        let fail = |msg: String| Err(OutputError::Schema(format!("{}: {msg}", self.sample_id)));

        if self.schema_version != SCHEMA_VERSION {
            return fail(format!("unsupported schema_version {}", self.schema_version));
        }
        if self.source != SOURCE {
            return fail(format!("unexpected source '{}'", self.source));
        }
        if crate::github::RepoId::parse(&self.repo_full_name).is_none() {
            return fail(format!("invalid repo_full_name '{}'", self.repo_full_name));
        }
        if !is_hex(&self.commit_sha, 40) {
            return fail(format!("commit_sha '{}' is not a full SHA-1", self.commit_sha));
        }
        if self.sample_id != sample_id(self.repo_id, &self.commit_sha) {
            return fail("sample_id does not match repo_id and commit_sha".to_string());
        }
        if self.terraform_files.is_empty() {
            return fail("no terraform_files".to_string());
        }
        if let Some(bad) = self.terraform_files.iter().find(|f| !is_hex(&f.sha256, 64)) {
            return fail(format!("invalid sha256 for {}", bad.path));
        }
        if self.content_digest != content_digest(&self.terraform_files) {
            return fail("content_digest does not match terraform_files".to_string());
        }
        if self.feature_vector.is_empty() {
            return fail("empty feature_vector".to_string());
        }
        if !self.filter_trace.is_complete() {
            return fail(format!(
                "filter_trace must pass every stage in order, got {:?}",
                self.filter_trace.stages()
            ));
        }
        Ok(())
    }
}

/// A candidate that did not make it into the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectRecord {
    pub repo_id: u64,
    pub repo_full_name: String,
    pub repo_url: String,
    pub commit_sha: Option<String>,
    /// `None` when the candidate never reached the chain.
    pub stage: Option<StageName>,
    pub code: RejectReason,
    /// Human-readable detail for `code`.
    pub reason: String,
    /// Stages evaluated up to and including the rejecting one.
    pub filter_trace: FilterTrace,
    pub crawl_timestamp: DateTime<Utc>,
    pub crawl_run_id: Uuid,
}

pub fn sample_id(repo_id: u64, commit_sha: &str) -> String {
    let short: String = commit_sha.chars().take(12).collect();
    format!("{repo_id}:{short}")
}

/// SHA-256 over the ordered `path\0sha256\n` list.
pub fn content_digest(files: &[RecordedFile]) -> String {
    let mut manifest = String::new();
    for file in files {
        manifest.push_str(&file.path);
        manifest.push('\0');
        manifest.push_str(&file.sha256);
        manifest.push('\n');
    }
    sha256_hex(manifest.as_bytes())
}

fn is_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Turns accepted snapshots and rejections into records, stamping each with
/// the run id.
#[derive(Debug, Clone)]
pub struct ProvenanceRecorder {
    run_id: Uuid,
}

impl Default for ProvenanceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvenanceRecorder {
    pub fn new() -> Self {
        Self { run_id: Uuid::new_v4() }
    }

    pub fn with_run_id(run_id: Uuid) -> Self {
        Self { run_id }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Build and validate the record for an accepted snapshot. Raw file
    /// bodies are dropped; only their hashes are kept.
    pub fn record(
        &self,
        snapshot: &RepositorySnapshot,
        features: FeatureVector,
        trace: FilterTrace,
    ) -> Result<DatasetRecord, OutputError> {
        let candidate = &snapshot.candidate;
        let terraform_files: Vec<RecordedFile> = snapshot
            .files
            .iter()
            .map(|f| RecordedFile {
                path: f.path.clone(),
                sha256: f.sha256.clone(),
                size_bytes: f.size_bytes,
            })
            .collect();

        let record = DatasetRecord {
            schema_version: SCHEMA_VERSION,
            sample_id: sample_id(candidate.id, &snapshot.commit_sha),
            repo_id: candidate.id,
            repo_full_name: candidate.repo.to_string(),
            repo_url: candidate.html_url.clone(),
            description: candidate.description.clone(),
            stars: candidate.stars,
            forks: candidate.forks,
            pushed_at: candidate.pushed_at,
            default_branch: candidate.default_branch.clone(),
            license: candidate.license.clone(),
            commit_sha: snapshot.commit_sha.clone(),
            crawl_timestamp: Utc::now(),
            crawl_run_id: self.run_id,
            source: SOURCE.to_string(),
            content_digest: content_digest(&terraform_files),
            terraform_files,
            feature_vector: features,
            filter_trace: trace,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn reject(
        &self,
        candidate: &CandidateRepository,
        commit_sha: Option<&str>,
        code: RejectReason,
        reason: impl Into<String>,
        trace: FilterTrace,
    ) -> RejectRecord {
        RejectRecord {
            repo_id: candidate.id,
            repo_full_name: candidate.repo.to_string(),
            repo_url: candidate.html_url.clone(),
            commit_sha: commit_sha.map(str::to_string),
            stage: trace.first_failure().map(|r| r.stage),
            code,
            reason: reason.into(),
            filter_trace: trace,
            crawl_timestamp: Utc::now(),
            crawl_run_id: self.run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::snapshot;
    use crate::filters::{FilterStageResult, StageName};

    fn passing_trace() -> FilterTrace {
        let mut trace = FilterTrace::new();
        for stage in StageName::ALL {
            trace.push(FilterStageResult::pass(stage, "ok"));
        }
        trace
    }

    fn features() -> FeatureVector {
        FeatureVector::extract(&snapshot(&[("main.tf", "resource \"aws_vpc\" \"a\" {}")]).files)
    }

    #[test]
    fn record_carries_provenance_without_bodies() {
        let snap = snapshot(&[
            ("b.tf", "resource \"aws_vpc\" \"a\" {}"),
            ("a.tf", "variable \"x\" {}"),
        ]);
        let recorder = ProvenanceRecorder::new();
        let record = recorder.record(&snap, features(), passing_trace()).unwrap();

        assert_eq!(record.sample_id, format!("42:{}", "a".repeat(12)));
        assert_eq!(record.repo_full_name, "acme/infra");
        assert_eq!(record.crawl_run_id, recorder.run_id());
        assert_eq!(record.terraform_files.len(), 2);
        assert_eq!(record.terraform_files[0].sha256, snap.files[0].sha256);

        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        assert!(!line.contains("\"content\""));
        let back: DatasetRecord = serde_json::from_str(&line).unwrap();
        back.validate().unwrap();
    }

    #[test]
    fn incomplete_trace_violates_schema() {
        let snap = snapshot(&[("main.tf", "resource \"aws_vpc\" \"a\" {}")]);
        let mut trace = passing_trace();
        trace.push(FilterStageResult::pass(StageName::Maturity, "again"));
        let err = ProvenanceRecorder::new()
            .record(&snap, features(), trace)
            .unwrap_err();
        assert!(matches!(err, OutputError::Schema(_)));

        let err = ProvenanceRecorder::new()
            .record(&snap, features(), FilterTrace::new())
            .unwrap_err();
        assert!(matches!(err, OutputError::Schema(_)));
    }

    #[test]
    fn tampered_digest_is_detected() {
        let snap = snapshot(&[("main.tf", "resource \"aws_vpc\" \"a\" {}")]);
        let mut record = ProvenanceRecorder::new()
            .record(&snap, features(), passing_trace())
            .unwrap();
        record.terraform_files[0].path = "other.tf".into();
        assert!(record.validate().is_err());
    }

    #[test]
    fn content_digest_depends_on_order() {
        let a = RecordedFile {
            path: "a.tf".into(),
            sha256: "0".repeat(64),
            size_bytes: 1,
        };
        let b = RecordedFile {
            path: "b.tf".into(),
            sha256: "1".repeat(64),
            size_bytes: 1,
        };
        assert_ne!(
            content_digest(&[a.clone(), b.clone()]),
            content_digest(&[b, a])
        );
    }

    #[test]
    fn reject_record_names_failing_stage() {
        let snap = snapshot(&[]);
        let mut trace = FilterTrace::new();
        trace.push(FilterStageResult::fail(
            StageName::KeywordExclusion,
            RejectReason::KeywordExcluded,
            "demo",
        ));
        let reject = ProvenanceRecorder::new().reject(
            &snap.candidate,
            Some(&snap.commit_sha),
            RejectReason::KeywordExcluded,
            "demo",
            trace,
        );
        assert_eq!(reject.stage, Some(StageName::KeywordExclusion));
        assert_eq!(reject.filter_trace.len(), 1);
    }
}
