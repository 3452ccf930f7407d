//! `terraform init` + `terraform validate` in a throwaway directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Evidence, FilterStage, FilterStageResult, RejectReason, StageContext, StageName};
use crate::error::ProcessError;
use crate::execution::{CommandRunner, CommandSpec};
use crate::github::{fetcher::validate_file_path, SnapshotFile};

#[derive(Debug, Clone)]
pub struct SyntaxConfig {
    pub terraform_bin: String,
    /// Applied to each step separately.
    pub timeout: Duration,
    pub dry_run: bool,
    /// Parent for scratch directories; the system temp dir when unset.
    pub scratch_root: Option<PathBuf>,
    /// Shared provider plugin cache (`TF_PLUGIN_CACHE_DIR`).
    pub plugin_cache_dir: Option<PathBuf>,
}

impl Default for SyntaxConfig {
    fn default() -> Self {
        Self {
            terraform_bin: "terraform".to_string(),
            timeout: Duration::from_secs(120),
            dry_run: false,
            scratch_root: None,
            plugin_cache_dir: None,
        }
    }
}

pub struct SyntaxValidator {
    config: SyntaxConfig,
    runner: Arc<dyn CommandRunner>,
}

/// Why a validation attempt did not reach a verdict from the tool.
enum StepFailure {
    Exit { step: &'static str, code: i32, stderr: String },
    Timeout { step: &'static str, timeout: Duration },
    Io(String),
}

impl SyntaxValidator {
    pub fn new(config: SyntaxConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn scratch_dir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("iac-sieve-validate-");
        match &self.config.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
    }

    async fn materialize(root: &Path, files: &[SnapshotFile]) -> Result<(), String> {
        for file in files {
            validate_file_path(&file.path).map_err(|e| e.to_string())?;
            let target = root.join(&file.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("create {}: {e}", parent.display()))?;
            }
            tokio::fs::write(&target, file.content.as_bytes())
                .await
                .map_err(|e| format!("write {}: {e}", file.path))?;
        }
        Ok(())
    }

    fn step(&self, cwd: &Path, args: &[&str]) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.terraform_bin, cwd)
            .args(args.iter().copied())
            .timeout(self.config.timeout)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .env("CHECKPOINT_DISABLE", "1");
        if let Some(cache) = &self.config.plugin_cache_dir {
            spec = spec.env("TF_PLUGIN_CACHE_DIR", cache.display().to_string());
        }
        spec
    }

    async fn run_step(&self, step: &'static str, spec: CommandSpec) -> Result<(), StepFailure> {
        match self.runner.run(&spec).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(StepFailure::Exit {
                step,
                code: output.exit_code,
                stderr: first_line(&output.stderr),
            }),
            Err(ProcessError::Timeout { timeout, .. }) => {
                Err(StepFailure::Timeout { step, timeout })
            }
            Err(err) => Err(StepFailure::Io(err.to_string())),
        }
    }

    async fn validate_in(&self, root: &Path, files: &[SnapshotFile]) -> Result<(), StepFailure> {
        Self::materialize(root, files).await.map_err(StepFailure::Io)?;
        let init = self.step(root, &["init", "-backend=false", "-get=false", "-no-color"]);
        self.run_step("init", init).await?;
        self.run_step("validate", self.step(root, &["validate", "-no-color"]))
            .await
    }
}

fn first_line(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl FilterStage for SyntaxValidator {
    fn name(&self) -> StageName {
        StageName::SyntaxValidation
    }

    async fn evaluate(&self, ctx: &mut StageContext<'_>) -> FilterStageResult {
        if self.config.dry_run {
            return FilterStageResult::pass(self.name(), "skipped (dry run)");
        }
        let snapshot = ctx.snapshot;
        if snapshot.files.is_empty() {
            return FilterStageResult::pass(self.name(), "no files to validate");
        }

        let dir = match self.scratch_dir() {
            Ok(dir) => dir,
            Err(err) => {
                return FilterStageResult::fail(
                    self.name(),
                    RejectReason::ScratchIoError,
                    format!("cannot create scratch directory: {err}"),
                )
            }
        };

        // `dir` is removed when it goes out of scope, whatever the outcome.
        let outcome = self.validate_in(dir.path(), &snapshot.files).await;
        tracing::debug!(
            repo = %snapshot.candidate.repo,
            scratch = %dir.path().display(),
            ok = outcome.is_ok(),
            "Validation finished"
        );
        drop(dir);

        match outcome {
            Ok(()) => FilterStageResult::pass(
                self.name(),
                format!("terraform validate passed for {} files", snapshot.files.len()),
            ),
            Err(StepFailure::Exit { step, code, stderr }) => FilterStageResult::fail(
                self.name(),
                RejectReason::SyntaxError,
                format!("terraform {step} exited with {code}: {stderr}"),
            )
            .with_evidence(Evidence::Number(f64::from(code))),
            Err(StepFailure::Timeout { step, timeout }) => FilterStageResult::fail(
                self.name(),
                RejectReason::ValidationTimeout,
                format!("terraform {step} exceeded {}s", timeout.as_secs()),
            )
            .with_evidence(Evidence::Number(timeout.as_secs_f64())),
            Err(StepFailure::Io(message)) => {
                tracing::warn!(
                    repo = %snapshot.candidate.repo,
                    error = %message,
                    "Scratch validation failed"
                );
                FilterStageResult::fail(self.name(), RejectReason::ScratchIoError, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::CommandOutput;
    use crate::filters::test_support::snapshot;
    use std::sync::Mutex;

    /// Records every spawn and whether the scratch files were present.
    #[derive(Default)]
    struct ScriptedRunner {
        /// Exit code per step, or `None` for a timeout.
        script: Vec<Option<i32>>,
        seen: Mutex<Vec<(CommandSpec, bool)>>,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
            let mut seen = self.seen.lock().unwrap();
            let had_files = spec.working_dir.join("main.tf").is_file();
            let step = seen.len();
            seen.push((spec.clone(), had_files));
            match self.script.get(step).copied().flatten() {
                Some(code) => Ok(CommandOutput {
                    exit_code: code,
                    stdout: String::new(),
                    stderr: if code == 0 {
                        String::new()
                    } else {
                        "\nError: Unsupported block type\n".into()
                    },
                    duration: Duration::from_millis(5),
                }),
                None => Err(ProcessError::Timeout {
                    program: spec.program.clone(),
                    timeout: spec.timeout,
                }),
            }
        }
    }

    fn validator(runner: Arc<ScriptedRunner>, dry_run: bool) -> SyntaxValidator {
        SyntaxValidator::new(
            SyntaxConfig {
                dry_run,
                timeout: Duration::from_secs(7),
                ..SyntaxConfig::default()
            },
            runner,
        )
    }

    fn files() -> crate::github::RepositorySnapshot {
        snapshot(&[
            ("main.tf", "resource \"aws_vpc\" \"main\" {}"),
            ("modules/net/vars.tf", "variable \"cidr\" {}"),
        ])
    }

    #[tokio::test]
    async fn runs_init_then_validate_in_scratch_dir() {
        let runner = Arc::new(ScriptedRunner {
            script: vec![Some(0), Some(0)],
            ..Default::default()
        });
        let snap = files();
        let result = validator(runner.clone(), false)
            .evaluate(&mut StageContext::new(&snap))
            .await;
        assert!(result.passed, "{result:?}");

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0.args, vec!["init", "-backend=false", "-get=false", "-no-color"]);
        assert_eq!(seen[1].0.args, vec!["validate", "-no-color"]);
        assert!(seen.iter().all(|(_, had_files)| *had_files));
        assert_eq!(seen[0].0.timeout, Duration::from_secs(7));
        assert!(!seen[0].0.working_dir.exists());
    }

    #[tokio::test]
    async fn non_zero_exit_is_syntax_error() {
        let runner = Arc::new(ScriptedRunner {
            script: vec![Some(0), Some(1)],
            ..Default::default()
        });
        let snap = files();
        let result = validator(runner.clone(), false)
            .evaluate(&mut StageContext::new(&snap))
            .await;
        assert!(!result.passed);
        assert_eq!(result.code, Some(RejectReason::SyntaxError));
        assert!(result.reason.contains("validate exited with 1"));
        assert!(result.reason.contains("Unsupported block type"));
    }

    #[tokio::test]
    async fn failed_init_skips_validate() {
        let runner = Arc::new(ScriptedRunner {
            script: vec![Some(1)],
            ..Default::default()
        });
        let snap = files();
        let result = validator(runner.clone(), false)
            .evaluate(&mut StageContext::new(&snap))
            .await;
        assert_eq!(result.code, Some(RejectReason::SyntaxError));
        assert_eq!(runner.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timeout_is_reported_and_scratch_removed() {
        let runner = Arc::new(ScriptedRunner {
            script: vec![None],
            ..Default::default()
        });
        let snap = files();
        let result = validator(runner.clone(), false)
            .evaluate(&mut StageContext::new(&snap))
            .await;
        assert_eq!(result.code, Some(RejectReason::ValidationTimeout));
        let seen = runner.seen.lock().unwrap();
        assert!(!seen[0].0.working_dir.exists());
    }

    #[tokio::test]
    async fn dry_run_never_spawns() {
        let runner = Arc::new(ScriptedRunner::default());
        let snap = files();
        let result = validator(runner.clone(), true)
            .evaluate(&mut StageContext::new(&snap))
            .await;
        assert!(result.passed);
        assert!(runner.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn plugin_cache_is_passed_through_env() {
        let runner = Arc::new(ScriptedRunner {
            script: vec![Some(0), Some(0)],
            ..Default::default()
        });
        let v = SyntaxValidator::new(
            SyntaxConfig {
                plugin_cache_dir: Some(PathBuf::from("/var/cache/tf")),
                ..SyntaxConfig::default()
            },
            runner.clone(),
        );
        let snap = files();
        v.evaluate(&mut StageContext::new(&snap)).await;
        let seen = runner.seen.lock().unwrap();
        assert!(seen[0]
            .0
            .env
            .contains(&("TF_PLUGIN_CACHE_DIR".to_string(), "/var/cache/tf".to_string())));
    }
}
