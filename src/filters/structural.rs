use async_trait::async_trait;

use super::features::provider_of;
use super::hcl;
use super::{Evidence, FilterStage, FilterStageResult, RejectReason, StageContext, StageName};

#[derive(Debug, Clone)]
pub struct StructuralConfig {
    pub min_resources: usize,
    /// e.g. `aws`: at least one resource of this provider.
    pub required_provider: Option<String>,
}

impl Default for StructuralConfig {
    fn default() -> Self {
        Self {
            min_resources: 1,
            required_provider: None,
        }
    }
}

/// Every file decodes as UTF-8, scans as HCL and declares at least one
/// top-level block; the snapshot as a whole meets the resource thresholds.
#[derive(Debug, Clone)]
pub struct StructuralFilter {
    config: StructuralConfig,
}

impl StructuralFilter {
    pub fn new(config: StructuralConfig) -> Self {
        Self { config }
    }

    fn fail(&self, reason: impl Into<String>) -> FilterStageResult {
        FilterStageResult::fail(self.name(), RejectReason::StructuralFailed, reason)
    }
}

#[async_trait]
impl FilterStage for StructuralFilter {
    fn name(&self) -> StageName {
        StageName::Structural
    }

    async fn evaluate(&self, ctx: &mut StageContext<'_>) -> FilterStageResult {
        let files = &ctx.snapshot.files;
        if files.is_empty() {
            return self.fail("no Terraform files in snapshot");
        }

        let mut resources = 0usize;
        let mut provider_hit = false;
        for file in files {
            if !file.utf8_valid {
                return self.fail(format!("{} is not valid UTF-8", file.path));
            }
            let doc = match hcl::parse(&file.content) {
                Ok(doc) => doc,
                Err(err) => return self.fail(format!("{}: {err}", file.path)),
            };
            if doc.blocks.is_empty() {
                return self.fail(format!("{} has no top-level blocks", file.path));
            }
            for block in doc.blocks_of("resource") {
                resources += 1;
                let provider = (&self.config.required_provider, block.label(0));
                if let (Some(required), Some(ty)) = provider {
                    provider_hit |= provider_of(ty) == required.as_str();
                }
            }
        }

        if resources < self.config.min_resources {
            return self
                .fail(format!(
                    "{resources} resource blocks, need at least {}",
                    self.config.min_resources
                ))
                .with_evidence(Evidence::Number(resources as f64));
        }
        if let Some(required) = &self.config.required_provider {
            if !provider_hit {
                return self
                    .fail(format!("no '{required}' resources"))
                    .with_evidence(Evidence::Number(resources as f64));
            }
        }

        FilterStageResult::pass(
            self.name(),
            format!("{} files, {resources} resource blocks", files.len()),
        )
        .with_evidence(Evidence::Number(resources as f64))
    }
}
