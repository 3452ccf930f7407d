//! Summary statistics over a written dataset.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tokio::io::AsyncBufReadExt;

use super::record::DatasetRecord;
use crate::error::OutputError;

/// At most this many invalid lines are itemised in the summary.
const MAX_REPORTED_ERRORS: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureSummary {
    pub count: u64,
    pub zero_frac: f64,
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineError {
    pub line: u64,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetStats {
    pub records: u64,
    pub invalid_lines: u64,
    pub errors: Vec<LineError>,
    pub distinct_repos: u64,
    pub features: BTreeMap<String, FeatureSummary>,
}

#[derive(Default)]
struct Accumulator {
    values: Vec<f64>,
}

impl Accumulator {
    fn summarize(&self) -> FeatureSummary {
        let n = self.values.len();
        if n == 0 {
            return FeatureSummary::default();
        }
        let count = n as f64;
        let mean = self.values.iter().sum::<f64>() / count;
        let variance = self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
        FeatureSummary {
            count: n as u64,
            zero_frac: self.values.iter().filter(|v| **v == 0.0).count() as f64 / count,
            mean,
            stddev: variance.sqrt(),
            min: self.values.iter().copied().fold(f64::INFINITY, f64::min),
            max: self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

impl DatasetStats {
    /// Read an NDJSON dataset, checking every non-empty line against the
    /// record schema. Invalid lines are counted, not fatal.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, OutputError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(|source| OutputError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut lines = tokio::io::BufReader::new(file).lines();

        let mut stats = Self::default();
        let mut repos = std::collections::HashSet::new();
        let mut acc: BTreeMap<String, Accumulator> = BTreeMap::new();
        let mut line_no = 0u64;

        while let Some(line) = lines.next_line().await.map_err(|source| OutputError::Open {
            path: path.to_path_buf(),
            source,
        })? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<DatasetRecord>(&line)
                .map_err(|e| e.to_string())
                .and_then(|r| r.validate().map(|()| r).map_err(|e| e.to_string()));
            match parsed {
                Ok(record) => {
                    stats.records += 1;
                    repos.insert(record.repo_id);
                    for (name, value) in record.feature_vector.iter() {
                        acc.entry(name.to_string()).or_default().values.push(value);
                    }
                }
                Err(error) => {
                    stats.invalid_lines += 1;
                    if stats.errors.len() < MAX_REPORTED_ERRORS {
                        stats.errors.push(LineError { line: line_no, error });
                    }
                }
            }
        }

        stats.distinct_repos = repos.len() as u64;
        stats.features = acc.into_iter().map(|(k, a)| (k, a.summarize())).collect();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::record::ProvenanceRecorder;
    use crate::filters::test_support::snapshot;
    use crate::filters::{FeatureVector, FilterStageResult, FilterTrace, StageName};

    fn record(resources: f64) -> DatasetRecord {
        let snap = snapshot(&[("main.tf", "resource \"aws_vpc\" \"a\" {}")]);
        let mut trace = FilterTrace::new();
        for stage in StageName::ALL {
            trace.push(FilterStageResult::pass(stage, "ok"));
        }
        let features: FeatureVector = [
            ("num_resources".to_string(), resources),
            ("iam_count".to_string(), 0.0),
        ]
        .into_iter()
        .collect();
        ProvenanceRecorder::new().record(&snap, features, trace).unwrap()
    }

    #[tokio::test]
    async fn summarizes_valid_lines_and_counts_invalid_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.ndjson");
        let mut body = String::new();
        for r in [record(2.0), record(4.0)] {
            body.push_str(&serde_json::to_string(&r).unwrap());
            body.push('\n');
        }
        body.push_str("{\"not\":\"a record\"}\n\n");
        let mut forged = record(6.0);
        forged.source = "gitlab".into();
        body.push_str(&serde_json::to_string(&forged).unwrap());
        body.push('\n');
        std::fs::write(&path, body).unwrap();

        let stats = DatasetStats::from_path(&path).await.unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.invalid_lines, 2);
        assert_eq!(stats.errors[0].line, 3);
        assert_eq!(stats.errors[1].line, 5);
        assert_eq!(stats.distinct_repos, 1);

        let resources = &stats.features["num_resources"];
        assert_eq!(resources.count, 2);
        assert_eq!(resources.mean, 3.0);
        assert_eq!(resources.stddev, 1.0);
        assert_eq!(resources.min, 2.0);
        assert_eq!(resources.max, 4.0);
        assert_eq!(stats.features["iam_count"].zero_frac, 1.0);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DatasetStats::from_path(dir.path().join("nope.ndjson")).await.is_err());
    }
}
