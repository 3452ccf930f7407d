use async_trait::async_trait;

use super::{Evidence, FilterStage, FilterStageResult, RejectReason, StageContext, StageName};

/// Rejects candidates mentioning a forbidden keyword anywhere in their name,
/// description, README or fetched files. Matching is case-insensitive
/// substring matching.
#[derive(Debug, Clone)]
pub struct KeywordFilter {
    /// Lowercased once at construction.
    forbidden: Vec<String>,
}

impl KeywordFilter {
    pub fn new<I, S>(forbidden: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            forbidden: forbidden
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    fn find_in<'k>(&'k self, text: &str) -> Option<&'k str> {
        let lowered = text.to_lowercase();
        self.forbidden
            .iter()
            .find(|k| lowered.contains(k.as_str()))
            .map(String::as_str)
    }
}

#[async_trait]
impl FilterStage for KeywordFilter {
    fn name(&self) -> StageName {
        StageName::KeywordExclusion
    }

    async fn evaluate(&self, ctx: &mut StageContext<'_>) -> FilterStageResult {
        let snapshot = ctx.snapshot;
        let candidate = &snapshot.candidate;

        let full_name = candidate.repo.to_string();
        let mut sources: Vec<(String, &str)> =
            vec![("repository name".to_string(), full_name.as_str())];
        if let Some(description) = candidate.description.as_deref() {
            sources.push(("description".to_string(), description));
        }
        if let Some(readme) = snapshot.readme.as_deref() {
            sources.push(("README".to_string(), readme));
        }
        for file in &snapshot.files {
            sources.push((file.path.clone(), file.content.as_str()));
        }

        for (location, text) in &sources {
            if let Some(keyword) = self.find_in(text) {
                return FilterStageResult::fail(
                    self.name(),
                    RejectReason::KeywordExcluded,
                    format!("forbidden keyword '{keyword}' found in {location}"),
                )
                .with_evidence(Evidence::Text(keyword.to_string()));
            }
        }

        FilterStageResult::pass(
            self.name(),
            format!("no forbidden keyword in {} sources", sources.len()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support::snapshot;

    async fn run(
        filter: &KeywordFilter,
        snap: &crate::github::RepositorySnapshot,
    ) -> FilterStageResult {
        filter.evaluate(&mut StageContext::new(snap)).await
    }

    #[tokio::test]
    async fn matches_description_in_any_casing() {
        let filter = KeywordFilter::new(["insecure"]);
        let mut snap = snapshot(&[("main.tf", "resource \"aws_vpc\" \"x\" {}")]);
        snap.candidate.description = Some("An INSECURE-by-design playground".into());

        let result = run(&filter, &snap).await;
        assert!(!result.passed);
        assert_eq!(result.code, Some(RejectReason::KeywordExcluded));
        assert_eq!(result.evidence, Some(Evidence::Text("insecure".into())));
        assert!(result.reason.contains("description"));
    }

    #[tokio::test]
    async fn matches_file_contents() {
        let filter = KeywordFilter::new(["Vulnerable"]);
        let snap = snapshot(&[
            ("a.tf", "# fine"),
            ("modules/b.tf", "# deliberately vulnerable bucket"),
        ]);
        let result = run(&filter, &snap).await;
        assert!(!result.passed);
        assert!(result.reason.contains("modules/b.tf"));
    }

    #[tokio::test]
    async fn matches_repository_name_and_readme() {
        let filter = KeywordFilter::new(["demo"]);
        let mut snap = snapshot(&[("main.tf", "")]);
        snap.candidate.repo = crate::github::RepoId::new("acme", "Terraform-Demo");
        assert!(!run(&filter, &snap).await.passed);

        let filter = KeywordFilter::new(["workshop"]);
        let mut snap = snapshot(&[("main.tf", "")]);
        snap.readme = Some("Material for the AWS Workshop".into());
        assert!(!run(&filter, &snap).await.passed);
    }

    #[tokio::test]
    async fn passes_clean_candidate() {
        let filter = KeywordFilter::new(["demo", "lab", "  "]);
        let snap = snapshot(&[("main.tf", "resource \"aws_s3_bucket\" \"logs\" {}")]);
        let result = run(&filter, &snap).await;
        assert!(result.passed);
        assert_eq!(result.code, None);
    }
}
