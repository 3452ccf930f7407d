//! Crawl configuration.
//!
//! Settings come from three layers, highest precedence first: command-line
//! flags, an optional YAML file, built-in defaults. Each layer is a
//! [`PartialConfig`]; [`CrawlConfig::resolve`] overlays them and validates the
//! result once. The resolved [`CrawlConfig`] is immutable and shared by every
//! component of the run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::execution::find_executable;
use crate::filters::features::{ALL_FEATURES, DEFAULT_MONITORED};
use crate::github::client::DEFAULT_API_BASE;

pub const TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const TOKEN_ENV_FALLBACK: &str = "GITHUB_PERSONAL_ACCESS_TOKEN";

/// GitHub token; never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiToken(String);

impl ApiToken {
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        let trimmed = token.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    /// `GITHUB_TOKEN`, falling back to `GITHUB_PERSONAL_ACCESS_TOKEN`.
    pub fn from_env() -> Option<Self> {
        [TOKEN_ENV, TOKEN_ENV_FALLBACK]
            .iter()
            .find_map(|key| std::env::var(key).ok().and_then(Self::new))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiToken(***)")
    }
}

/// One configuration layer. Unset fields fall through to the layer below.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartialConfig {
    pub keywords: Option<Vec<String>>,
    pub forbidden_keywords: Option<Vec<String>>,
    pub search_budget: Option<usize>,
    pub max_files: Option<usize>,
    pub extensions: Option<Vec<String>>,
    pub min_stars: Option<u64>,
    pub min_forks: Option<u64>,
    pub max_age_months: Option<u32>,
    pub require_readme: Option<bool>,
    pub min_resources: Option<usize>,
    pub required_provider: Option<String>,
    pub dry_run: Option<bool>,
    pub terraform_bin: Option<String>,
    pub validation_timeout_secs: Option<u64>,
    pub plugin_cache_dir: Option<PathBuf>,
    pub scratch_root: Option<PathBuf>,
    pub outlier_tolerance: Option<f64>,
    pub outlier_min_samples: Option<u64>,
    pub outlier_min_stddev: Option<f64>,
    pub monitored_features: Option<Vec<String>>,
    pub output: Option<PathBuf>,
    pub rejects: Option<PathBuf>,
    pub workers: Option<usize>,
    pub target_accepted: Option<usize>,
    pub api_base_url: Option<String>,
    pub progress_interval_secs: Option<u64>,
}

macro_rules! overlay {
    ($base:ident, $top:ident; $($field:ident),+ $(,)?) => {
        $( if $top.$field.is_some() { $base.$field = $top.$field; } )+
    };
}

impl PartialConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Fields set in `top` replace those in `self`.
    pub fn overlay(mut self, top: PartialConfig) -> Self {
        overlay!(self, top;
            keywords, forbidden_keywords, search_budget, max_files, extensions,
            min_stars, min_forks, max_age_months, require_readme, min_resources,
            required_provider, dry_run, terraform_bin, validation_timeout_secs,
            plugin_cache_dir, scratch_root, outlier_tolerance, outlier_min_samples,
            outlier_min_stddev, monitored_features, output, rejects, workers,
            target_accepted, api_base_url, progress_interval_secs,
        );
        self
    }
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    // Discovery
    pub keywords: Vec<String>,
    /// Upper bound on candidates considered across all keywords.
    pub search_budget: usize,
    /// REST root, overridable for GitHub Enterprise.
    pub api_base_url: String,
    pub github_token: Option<ApiToken>,

    // Fetching
    /// Per-candidate cap on fetched files; extras are counted, not fetched.
    pub max_files: usize,
    /// Path suffixes selected from the tree.
    pub extensions: Vec<String>,

    // Filters
    pub forbidden_keywords: Vec<String>,
    pub min_stars: u64,
    pub min_forks: u64,
    pub max_age_months: u32,
    pub require_readme: bool,
    pub min_resources: usize,
    /// Provider prefix of resource types, e.g. `aws` for `aws_instance`.
    pub required_provider: Option<String>,

    // Validation tool
    /// Skip spawning terraform; the syntax stage passes with a note.
    pub dry_run: bool,
    pub terraform_bin: String,
    /// Per step (`init`, `validate`).
    pub validation_timeout: Duration,
    /// Exported as `TF_PLUGIN_CACHE_DIR` to every init.
    pub plugin_cache_dir: Option<PathBuf>,
    /// Parent of per-candidate scratch directories; system temp when unset.
    pub scratch_root: Option<PathBuf>,

    // Outlier policy
    /// Allowed deviation in standard deviations.
    pub outlier_tolerance: f64,
    /// Accepted samples before the outlier check is enforced.
    pub outlier_min_samples: u64,
    /// Floor applied to the corpus stddev when computing the band.
    pub outlier_min_stddev: f64,
    pub monitored_features: Vec<String>,

    // Output and run control
    pub output: PathBuf,
    /// Optional NDJSON log of rejected candidates.
    pub rejects: Option<PathBuf>,
    pub workers: usize,
    /// Stop the crawl once this many records are accepted.
    pub target_accepted: Option<usize>,
    /// Zero disables the progress monitor.
    pub progress_interval: Duration,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            search_budget: 100,
            api_base_url: DEFAULT_API_BASE.to_string(),
            github_token: None,
            max_files: 200,
            extensions: vec![".tf".to_string()],
            forbidden_keywords: ["demo", "lab", "test", "vulnerable", "insecure"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_stars: 10,
            min_forks: 5,
            max_age_months: 24,
            require_readme: false,
            min_resources: 1,
            required_provider: None,
            dry_run: false,
            terraform_bin: "terraform".to_string(),
            validation_timeout: Duration::from_secs(120),
            plugin_cache_dir: None,
            scratch_root: None,
            outlier_tolerance: 3.0,
            outlier_min_samples: 10,
            outlier_min_stddev: 1.0,
            monitored_features: DEFAULT_MONITORED.iter().map(|s| s.to_string()).collect(),
            output: PathBuf::from("output/terraform_dataset.ndjson"),
            rejects: None,
            workers: 4,
            target_accepted: None,
            progress_interval: Duration::from_secs(30),
        }
    }
}

impl CrawlConfig {
    /// Overlay `layer` on the defaults and validate.
    pub fn resolve(
        layer: PartialConfig,
        github_token: Option<ApiToken>,
    ) -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            keywords: layer.keywords.unwrap_or(d.keywords),
            search_budget: layer.search_budget.unwrap_or(d.search_budget),
            api_base_url: layer.api_base_url.unwrap_or(d.api_base_url),
            github_token,
            max_files: layer.max_files.unwrap_or(d.max_files),
            extensions: layer.extensions.unwrap_or(d.extensions),
            forbidden_keywords: layer.forbidden_keywords.unwrap_or(d.forbidden_keywords),
            min_stars: layer.min_stars.unwrap_or(d.min_stars),
            min_forks: layer.min_forks.unwrap_or(d.min_forks),
            max_age_months: layer.max_age_months.unwrap_or(d.max_age_months),
            require_readme: layer.require_readme.unwrap_or(d.require_readme),
            min_resources: layer.min_resources.unwrap_or(d.min_resources),
            required_provider: layer.required_provider.or(d.required_provider),
            dry_run: layer.dry_run.unwrap_or(d.dry_run),
            terraform_bin: layer.terraform_bin.unwrap_or(d.terraform_bin),
            validation_timeout: layer
                .validation_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(d.validation_timeout),
            plugin_cache_dir: layer.plugin_cache_dir.or(d.plugin_cache_dir),
            scratch_root: layer.scratch_root.or(d.scratch_root),
            outlier_tolerance: layer.outlier_tolerance.unwrap_or(d.outlier_tolerance),
            outlier_min_samples: layer.outlier_min_samples.unwrap_or(d.outlier_min_samples),
            outlier_min_stddev: layer.outlier_min_stddev.unwrap_or(d.outlier_min_stddev),
            monitored_features: layer.monitored_features.unwrap_or(d.monitored_features),
            output: layer.output.unwrap_or(d.output),
            rejects: layer.rejects.or(d.rejects),
            workers: layer.workers.unwrap_or(d.workers),
            target_accepted: layer.target_accepted.or(d.target_accepted),
            progress_interval: layer
                .progress_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(d.progress_interval),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and combinations. Does not touch the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keywords.is_empty() {
            return Err(ConfigError::Missing("keywords".to_string()));
        }
        if self.keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(ConfigError::invalid("keywords", "keywords must not be blank"));
        }
        if self.forbidden_keywords.iter().any(|k| k.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "forbidden_keywords",
                "forbidden keywords must not be blank",
            ));
        }
        if self.search_budget == 0 {
            return Err(ConfigError::invalid("search_budget", "must be greater than 0"));
        }
        if self.max_files == 0 {
            return Err(ConfigError::invalid("max_files", "must be greater than 0"));
        }
        if self.extensions.is_empty() || self.extensions.iter().any(|e| e.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "extensions",
                "at least one non-blank extension is required",
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be greater than 0"));
        }
        if self.validation_timeout.is_zero() {
            return Err(ConfigError::invalid("validation_timeout_secs", "must be greater than 0"));
        }
        if self.terraform_bin.trim().is_empty() {
            return Err(ConfigError::invalid("terraform_bin", "cannot be empty"));
        }
        if !self.outlier_tolerance.is_finite() || self.outlier_tolerance <= 0.0 {
            return Err(ConfigError::invalid("outlier_tolerance", "must be a positive number"));
        }
        if self.outlier_min_samples == 0 {
            return Err(ConfigError::invalid("outlier_min_samples", "must be greater than 0"));
        }
        if !self.outlier_min_stddev.is_finite() || self.outlier_min_stddev < 0.0 {
            return Err(ConfigError::invalid("outlier_min_stddev", "cannot be negative"));
        }
        if let Some(unknown) = self
            .monitored_features
            .iter()
            .find(|f| !ALL_FEATURES.contains(&f.as_str()))
        {
            return Err(ConfigError::invalid(
                "monitored_features",
                format!("unknown feature '{unknown}'"),
            ));
        }
        if self.target_accepted == Some(0) {
            return Err(ConfigError::invalid("target_accepted", "must be greater than 0"));
        }
        if self.rejects.as_deref() == Some(self.output.as_path()) {
            return Err(ConfigError::invalid("rejects", "must differ from the output path"));
        }
        if let Some(provider) = &self.required_provider {
            if provider.trim().is_empty() || provider.contains('_') {
                return Err(ConfigError::invalid(
                    "required_provider",
                    "expected a provider name such as 'aws'",
                ));
            }
        }
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(ConfigError::invalid("api_base_url", "must be an http(s) URL"));
        }
        Ok(())
    }

    /// Checks that need the environment: the validation tool must be
    /// runnable unless this is a dry run.
    pub fn preflight(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if !self.dry_run && find_executable(&self.terraform_bin).is_none() {
            return Err(ConfigError::ToolNotFound(self.terraform_bin.clone()));
        }
        Ok(())
    }
}
