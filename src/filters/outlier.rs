//! Behavioural outlier detection against the corpus accepted so far.
//!
//! For every monitored feature the detector keeps a running mean and
//! population variance (Welford). Once `min_samples` candidates have been
//! accepted, a candidate fails when any monitored feature satisfies
//!
//! ```text
//! |x - mean| > tolerance * max(stddev, min_stddev)
//! ```
//!
//! The read of the statistics and the update on acceptance happen under one
//! lock, so concurrent workers never judge against the same stale state.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use super::features::{FeatureVector, DEFAULT_MONITORED};
use super::{Evidence, FilterStage, FilterStageResult, RejectReason, StageContext, StageName};

pub type SharedStatistics = Arc<Mutex<CorpusStatistics>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunningMoments {
    pub count: u64,
    pub mean: f64,
    m2: f64,
}

impl RunningMoments {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Per-feature moments over accepted candidates. Lives for one process run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorpusStatistics {
    accepted: u64,
    features: BTreeMap<String, RunningMoments>,
}

impl CorpusStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStatistics {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn moments(&self, feature: &str) -> Option<&RunningMoments> {
        self.features.get(feature)
    }

    pub fn record(&mut self, vector: &FeatureVector) {
        self.accepted += 1;
        for (name, value) in vector.iter() {
            self.features.entry(name.to_string()).or_default().push(value);
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutlierPolicy {
    /// Band half-width in standard deviations.
    pub tolerance: f64,
    /// Accepted candidates required before the band is enforced.
    pub min_samples: u64,
    /// Floor for the standard deviation used in the band.
    pub min_stddev: f64,
    pub monitored: Vec<String>,
}

impl Default for OutlierPolicy {
    fn default() -> Self {
        Self {
            tolerance: 3.0,
            min_samples: 10,
            min_stddev: 1.0,
            monitored: DEFAULT_MONITORED.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Deviation {
    pub feature: String,
    pub value: f64,
    pub mean: f64,
    pub band: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    /// Mean |z| over monitored features with history.
    pub score: f64,
    pub enforced: bool,
    pub deviations: Vec<Deviation>,
}

impl OutlierPolicy {
    pub fn assess(&self, stats: &CorpusStatistics, vector: &FeatureVector) -> Assessment {
        let mut z_sum = 0.0;
        let mut z_count = 0usize;
        let mut deviations = Vec::new();
        let enforced = stats.accepted() >= self.min_samples;

        for feature in &self.monitored {
            let (Some(value), Some(moments)) = (vector.get(feature), stats.moments(feature)) else {
                continue;
            };
            if moments.count == 0 {
                continue;
            }
            let scale = moments.stddev().max(self.min_stddev);
            let distance = (value - moments.mean).abs();
            if scale > 0.0 {
                z_sum += distance / scale;
                z_count += 1;
            }
            let band = self.tolerance * scale;
            if enforced && distance > band {
                deviations.push(Deviation {
                    feature: feature.clone(),
                    value,
                    mean: moments.mean,
                    band,
                });
            }
        }

        Assessment {
            score: if z_count == 0 { 0.0 } else { z_sum / z_count as f64 },
            enforced,
            deviations,
        }
    }
}

pub struct OutlierDetector {
    policy: OutlierPolicy,
    stats: SharedStatistics,
}

impl OutlierDetector {
    pub fn new(policy: OutlierPolicy, stats: SharedStatistics) -> Self {
        Self { policy, stats }
    }

    pub fn statistics(&self) -> SharedStatistics {
        self.stats.clone()
    }

    /// Judge `vector` and, if it passes, fold it into the statistics.
    pub async fn check_and_record(&self, vector: &FeatureVector) -> FilterStageResult {
        let mut stats = self.stats.lock().await;
        let assessment = self.policy.assess(&stats, vector);
        let score = (assessment.score * 1000.0).round() / 1000.0;

        if !assessment.deviations.is_empty() {
            let detail = assessment
                .deviations
                .iter()
                .map(|d| {
                    format!("{}={} (mean {:.2}, band ±{:.2})", d.feature, d.value, d.mean, d.band)
                })
                .collect::<Vec<_>>()
                .join(", ");
            return FilterStageResult::fail(
                self.name(),
                RejectReason::BehaviorOutlier,
                format!("outside tolerance band: {detail}"),
            )
            .with_evidence(Evidence::Number(score));
        }

        stats.record(vector);
        let reason = if assessment.enforced {
            format!("within tolerance of {} accepted candidates", stats.accepted() - 1)
        } else {
            format!(
                "collecting baseline ({}/{} samples)",
                stats.accepted(),
                self.policy.min_samples
            )
        };
        FilterStageResult::pass(self.name(), reason).with_evidence(Evidence::Number(score))
    }
}

#[async_trait]
impl FilterStage for OutlierDetector {
    fn name(&self) -> StageName {
        StageName::BehaviorOutlier
    }

    async fn evaluate(&self, ctx: &mut StageContext<'_>) -> FilterStageResult {
        let vector = FeatureVector::extract(&ctx.snapshot.files);
        let result = self.check_and_record(&vector).await;
        ctx.features = Some(vector);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::features::{NUM_FILES, NUM_RESOURCES};

    fn vector(resources: f64) -> FeatureVector {
        [
            (NUM_RESOURCES.to_string(), resources),
            (NUM_FILES.to_string(), 2.0),
        ]
        .into_iter()
        .collect()
    }

    fn detector() -> OutlierDetector {
        OutlierDetector::new(OutlierPolicy::default(), CorpusStatistics::shared())
    }

    #[test]
    fn welford_matches_population_moments() {
        let mut m = RunningMoments::default();
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            m.push(x);
        }
        assert_eq!(m.count, 8);
        assert!((m.mean - 5.0).abs() < 1e-12);
        assert!((m.stddev() - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn baseline_is_collected_without_enforcing() {
        let d = detector();
        for x in [1.0, 50.0, 1000.0] {
            assert!(d.check_and_record(&vector(x)).await.passed);
        }
        assert_eq!(d.statistics().lock().await.accepted(), 3);
    }

    #[tokio::test]
    async fn extreme_candidate_after_ten_is_rejected_without_updating() {
        let d = detector();
        for x in 4..14 {
            assert!(d.check_and_record(&vector(f64::from(x))).await.passed);
        }
        let before = d.statistics().lock().await.clone();
        let m = *before.moments(NUM_RESOURCES).unwrap();
        let far = m.mean + 10.0 * m.stddev();

        let result = d.check_and_record(&vector(far)).await;
        assert!(!result.passed);
        assert_eq!(result.code, Some(RejectReason::BehaviorOutlier));
        assert!(result.reason.contains(NUM_RESOURCES));
        match result.evidence {
            Some(Evidence::Number(score)) => assert!(score >= 4.0),
            other => panic!("unexpected evidence {other:?}"),
        }

        assert_eq!(*d.statistics().lock().await, before);
    }

    #[tokio::test]
    async fn in_band_candidate_updates_statistics() {
        let d = detector();
        for x in 4..14 {
            d.check_and_record(&vector(f64::from(x))).await;
        }
        let result = d.check_and_record(&vector(9.0)).await;
        assert!(result.passed);
        assert_eq!(d.statistics().lock().await.accepted(), 11);
    }

    #[tokio::test]
    async fn zero_variance_uses_stddev_floor() {
        let d = detector();
        for _ in 0..10 {
            d.check_and_record(&vector(5.0)).await;
        }
        assert!(d.check_and_record(&vector(8.0)).await.passed);
        assert!(!d.check_and_record(&vector(9.5)).await.passed);
    }

    #[tokio::test]
    async fn low_variance_corpus_is_judged_against_the_floor() {
        let floored = detector();
        let unfloored = OutlierDetector::new(
            OutlierPolicy {
                min_stddev: 0.0,
                ..OutlierPolicy::default()
            },
            CorpusStatistics::shared(),
        );
        for d in [&floored, &unfloored] {
            for i in 0..10 {
                let x = if i % 2 == 0 { 5.0 } else { 5.4 };
                assert!(d.check_and_record(&vector(x)).await.passed);
            }
        }
        let m = *floored.statistics().lock().await.moments(NUM_RESOURCES).unwrap();
        assert!((m.stddev() - 0.2).abs() < 1e-9);

        // 10 sigma, but inside tolerance * min_stddev.
        let far = m.mean + 10.0 * m.stddev();
        assert!(floored.check_and_record(&vector(far)).await.passed);
        assert!(!unfloored.check_and_record(&vector(far)).await.passed);
    }

    #[test]
    fn unmonitored_features_are_ignored() {
        let policy = OutlierPolicy {
            monitored: vec![NUM_FILES.to_string()],
            min_samples: 1,
            ..OutlierPolicy::default()
        };
        let mut stats = CorpusStatistics::new();
        stats.record(&vector(1.0));
        let assessment = policy.assess(&stats, &vector(1_000_000.0));
        assert!(assessment.enforced);
        assert!(assessment.deviations.is_empty());
    }

    #[tokio::test]
    async fn evaluate_attaches_features() {
        let snap = crate::filters::test_support::snapshot(&[(
            "main.tf",
            "resource \"aws_vpc\" \"a\" {}\nresource \"aws_subnet\" \"b\" {}\n",
        )]);
        let mut ctx = StageContext::new(&snap);
        let result = detector().evaluate(&mut ctx).await;
        assert!(result.passed);
        assert_eq!(ctx.features.unwrap().get(NUM_RESOURCES), Some(2.0));
    }
}
