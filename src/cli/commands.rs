//! CLI command definitions for iac-sieve.
//!
//! `crawl` discovers, filters and records Terraform repositories; `stats`
//! checks an existing dataset against the record schema and summarizes it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::execution::TokioCommandRunner;
use crate::export::DatasetStats;
use crate::github::{HttpGitHubClient, RateLimiter};
use crate::pipeline::{ApiToken, CrawlConfig, CrawlPipeline, PartialConfig};

/// Crawl GitHub for Terraform configurations and build a filtered dataset.
#[derive(Parser)]
#[command(name = "iac-sieve")]
#[command(about = "Crawl and filter Terraform repositories into a provenance-rich NDJSON dataset")]
#[command(version)]
#[command(
    long_about = "iac-sieve searches GitHub for Terraform (HCL) repositories, pins each to a \
commit, and runs keyword, maturity, terraform validate, structural and outlier filters \
before appending accepted snapshots to an NDJSON dataset.\n\nExample usage:\n  \
iac-sieve crawl --keywords terraform,aws --search-budget 200 \\\n    \
--output output/terraform_dataset.ndjson"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Discover, filter and record repositories.
    Crawl(Box<CrawlArgs>),

    /// Validate an NDJSON dataset and print per-feature statistics as JSON.
    Stats(StatsArgs),
}

/// Arguments for `iac-sieve crawl`.
///
/// Unset flags fall back to the `--config` file, then to built-in defaults.
#[derive(Parser, Debug, Default)]
pub struct CrawlArgs {
    /// YAML file providing defaults for any crawl setting.
    #[arg(long, env = "IAC_SIEVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Search keywords; one search query is issued per keyword.
    #[arg(short, long, value_delimiter = ',', num_args = 1..)]
    pub keywords: Option<Vec<String>>,

    /// Keywords that exclude a repository (case-insensitive).
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub forbidden_keywords: Option<Vec<String>>,

    /// Maximum number of candidates to consider.
    #[arg(long, alias = "search-limit")]
    pub search_budget: Option<usize>,

    /// Maximum Terraform files fetched per repository.
    #[arg(long, alias = "max-tf-files")]
    pub max_files: Option<usize>,

    /// File suffixes to fetch.
    #[arg(long, value_delimiter = ',')]
    pub extensions: Option<Vec<String>>,

    #[arg(long)]
    pub min_stars: Option<u64>,

    #[arg(long)]
    pub min_forks: Option<u64>,

    /// Maximum months since the last push.
    #[arg(long)]
    pub max_age_months: Option<u32>,

    /// Reject repositories without a README.
    #[arg(long)]
    pub require_readme: bool,

    /// Minimum number of resource blocks.
    #[arg(long)]
    pub min_resources: Option<usize>,

    /// Require at least one resource of this provider (e.g. aws).
    #[arg(long)]
    pub required_provider: Option<String>,

    /// Skip `terraform init/validate` and never spawn the validation tool.
    #[arg(long)]
    pub dry_run: bool,

    /// Path or name of the terraform binary.
    #[arg(long)]
    pub terraform_bin: Option<String>,

    /// Timeout per terraform step, in seconds.
    #[arg(long, alias = "terraform-timeout-sec")]
    pub validation_timeout_secs: Option<u64>,

    /// Shared provider plugin cache for terraform init.
    #[arg(long)]
    pub plugin_cache_dir: Option<PathBuf>,

    /// Directory in which scratch validation directories are created.
    #[arg(long)]
    pub scratch_root: Option<PathBuf>,

    /// Outlier band half-width, in standard deviations.
    #[arg(long, alias = "outlier-threshold")]
    pub outlier_tolerance: Option<f64>,

    /// Accepted candidates required before the outlier band is enforced.
    #[arg(long)]
    pub outlier_min_samples: Option<u64>,

    /// Floor for the standard deviation used in the outlier band.
    #[arg(long)]
    pub outlier_min_stddev: Option<f64>,

    /// Features the outlier band is enforced on.
    #[arg(long, value_delimiter = ',')]
    pub monitored_features: Option<Vec<String>>,

    /// Dataset output (NDJSON, appended).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Optional NDJSON log of rejected candidates.
    #[arg(long)]
    pub rejects: Option<PathBuf>,

    /// Candidates processed concurrently.
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,

    /// Stop once this many records have been written.
    #[arg(long)]
    pub target_accepted: Option<usize>,

    /// GitHub API base URL (GitHub Enterprise).
    #[arg(long)]
    pub api_base_url: Option<String>,

    /// Seconds between progress log lines; 0 disables them.
    #[arg(long)]
    pub progress_interval_secs: Option<u64>,

    /// GitHub token (falls back to GITHUB_PERSONAL_ACCESS_TOKEN).
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,
}

impl CrawlArgs {
    fn flag_layer(&self) -> PartialConfig {
        PartialConfig {
            keywords: self.keywords.clone(),
            forbidden_keywords: self.forbidden_keywords.clone(),
            search_budget: self.search_budget,
            max_files: self.max_files,
            extensions: self.extensions.clone(),
            min_stars: self.min_stars,
            min_forks: self.min_forks,
            max_age_months: self.max_age_months,
            require_readme: self.require_readme.then_some(true),
            min_resources: self.min_resources,
            required_provider: self.required_provider.clone(),
            dry_run: self.dry_run.then_some(true),
            terraform_bin: self.terraform_bin.clone(),
            validation_timeout_secs: self.validation_timeout_secs,
            plugin_cache_dir: self.plugin_cache_dir.clone(),
            scratch_root: self.scratch_root.clone(),
            outlier_tolerance: self.outlier_tolerance,
            outlier_min_samples: self.outlier_min_samples,
            outlier_min_stddev: self.outlier_min_stddev,
            monitored_features: self.monitored_features.clone(),
            output: self.output.clone(),
            rejects: self.rejects.clone(),
            workers: self.workers,
            target_accepted: self.target_accepted,
            api_base_url: self.api_base_url.clone(),
            progress_interval_secs: self.progress_interval_secs,
        }
    }

    /// Flags over the config file over defaults.
    pub fn resolve(&self) -> Result<CrawlConfig, ConfigError> {
        let file_layer = match &self.config {
            Some(path) => PartialConfig::from_yaml_file(path)?,
            None => PartialConfig::default(),
        };
        let token = self
            .github_token
            .clone()
            .and_then(ApiToken::new)
            .or_else(ApiToken::from_env);
        CrawlConfig::resolve(file_layer.overlay(self.flag_layer()), token)
    }
}

/// Arguments for `iac-sieve stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// NDJSON dataset to read.
    #[arg(default_value = "output/terraform_dataset.ndjson")]
    pub input: PathBuf,

    /// Exit with an error if any line violates the schema.
    #[arg(long)]
    pub strict: bool,
}

/// Parse CLI arguments without executing any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with already parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Crawl(args) => run_crawl_command(*args).await,
        Commands::Stats(args) => run_stats_command(args).await,
    }
}

async fn run_crawl_command(args: CrawlArgs) -> anyhow::Result<()> {
    let config = args.resolve()?;
    config.preflight()?;

    if config.github_token.is_none() {
        warn!(
            "No GitHub token found in GITHUB_TOKEN or GITHUB_PERSONAL_ACCESS_TOKEN; \
             unauthenticated requests have a much smaller quota"
        );
    }
    if config.dry_run {
        info!("Dry run: terraform validation is skipped");
    }

    let limiter = Arc::new(RateLimiter::new());
    let client = HttpGitHubClient::new(
        config.github_token.as_ref().map(|t| t.expose().to_string()),
        limiter,
    )
    .with_base_url(config.api_base_url.clone());

    let pipeline = CrawlPipeline::new(config, Arc::new(client), Arc::new(TokioCommandRunner));
    let summary = pipeline.run().await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<()> {
    let stats = DatasetStats::from_path(&args.input).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if stats.invalid_lines > 0 {
        warn!(
            invalid = stats.invalid_lines,
            input = %args.input.display(),
            "Dataset contains invalid lines"
        );
        if args.strict {
            anyhow::bail!(
                "{} of {} lines violate the record schema",
                stats.invalid_lines,
                stats.invalid_lines + stats.records
            );
        }
    }
    Ok(())
}
