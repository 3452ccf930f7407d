use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Evidence, FilterStage, FilterStageResult, RejectReason, StageContext, StageName};

#[derive(Debug, Clone)]
pub struct MaturityThresholds {
    pub min_stars: u64,
    pub min_forks: u64,
    /// Maximum months since the last push.
    pub max_age_months: u32,
    /// Reject candidates without a README.
    pub require_readme: bool,
}

impl Default for MaturityThresholds {
    fn default() -> Self {
        Self {
            min_stars: 10,
            min_forks: 5,
            max_age_months: 24,
            require_readme: false,
        }
    }
}

/// Popularity and recency gate. Every threshold must hold.
#[derive(Debug, Clone)]
pub struct MaturityFilter {
    thresholds: MaturityThresholds,
    now: Option<DateTime<Utc>>,
}

impl MaturityFilter {
    pub fn new(thresholds: MaturityThresholds) -> Self {
        Self {
            thresholds,
            now: None,
        }
    }

    /// Evaluate ages against a fixed clock.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }
}

/// Whole 30-day months elapsed since `pushed_at`; never negative.
pub fn months_since(pushed_at: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    let days = (now - pushed_at).num_days().max(0);
    u32::try_from(days / 30).unwrap_or(u32::MAX)
}

#[async_trait]
impl FilterStage for MaturityFilter {
    fn name(&self) -> StageName {
        StageName::Maturity
    }

    async fn evaluate(&self, ctx: &mut StageContext<'_>) -> FilterStageResult {
        let t = &self.thresholds;
        let candidate = &ctx.snapshot.candidate;
        let age = months_since(candidate.pushed_at, self.now.unwrap_or_else(Utc::now));

        let mut failures = Vec::new();
        if candidate.stars < t.min_stars {
            failures.push(format!("stars {} < {}", candidate.stars, t.min_stars));
        }
        if candidate.forks < t.min_forks {
            failures.push(format!("forks {} < {}", candidate.forks, t.min_forks));
        }
        if age > t.max_age_months {
            failures.push(format!("last push {age} months ago > {}", t.max_age_months));
        }
        if t.require_readme && ctx.snapshot.readme.is_none() {
            failures.push("no README".to_string());
        }

        if failures.is_empty() {
            FilterStageResult::pass(
                self.name(),
                format!(
                    "stars {}, forks {}, last push {age} months ago",
                    candidate.stars, candidate.forks
                ),
            )
            .with_evidence(Evidence::Number(f64::from(age)))
        } else {
            FilterStageResult::fail(self.name(), RejectReason::MaturityFailed, failures.join("; "))
                .with_evidence(Evidence::Number(f64::from(age)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::snapshot;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-14T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn check(
        stars: u64,
        forks: u64,
        days_old: i64,
        thresholds: MaturityThresholds,
    ) -> FilterStageResult {
        let mut snap = snapshot(&[("main.tf", "")]);
        snap.candidate.stars = stars;
        snap.candidate.forks = forks;
        snap.candidate.pushed_at = now() - Duration::days(days_old);
        MaturityFilter::new(thresholds)
            .at(now())
            .evaluate(&mut StageContext::new(&snap))
            .await
    }

    #[test]
    fn months_are_thirty_day_buckets() {
        assert_eq!(months_since(now() - Duration::days(29), now()), 0);
        assert_eq!(months_since(now() - Duration::days(60), now()), 2);
        assert_eq!(months_since(now() + Duration::days(5), now()), 0);
    }

    #[tokio::test]
    async fn all_thresholds_must_hold() {
        let t = MaturityThresholds::default();
        assert!(check(10, 5, 24 * 30, t.clone()).await.passed);

        let low_stars = check(9, 100, 1, t.clone()).await;
        assert!(!low_stars.passed);
        assert_eq!(low_stars.code, Some(RejectReason::MaturityFailed));
        assert!(low_stars.reason.contains("stars"));

        assert!(!check(100, 4, 1, t.clone()).await.passed);
        assert!(!check(100, 100, 25 * 30, t).await.passed);
    }

    #[tokio::test]
    async fn zero_thresholds_accept_anything_recent() {
        let t = MaturityThresholds {
            min_stars: 0,
            min_forks: 0,
            ..MaturityThresholds::default()
        };
        assert!(check(0, 0, 3, t).await.passed);
    }

    #[tokio::test]
    async fn readme_requirement() {
        let t = MaturityThresholds {
            require_readme: true,
            ..MaturityThresholds::default()
        };
        let result = check(100, 100, 1, t).await;
        assert!(!result.passed);
        assert!(result.reason.contains("README"));
    }
}
