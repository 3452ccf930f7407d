//! Command-line interface for iac-sieve.
//!
//! Provides the `crawl` and `stats` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, CrawlArgs, StatsArgs};
