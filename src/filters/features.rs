//! Structural and governance features of a Terraform snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::hcl::{self, HclDocument};
use crate::github::SnapshotFile;

pub const NUM_FILES: &str = "num_files";
pub const NUM_RESOURCES: &str = "num_resources";
pub const NUM_MODULES: &str = "num_modules";
pub const NUM_VARIABLES: &str = "num_variables";
pub const NUM_OUTPUTS: &str = "num_outputs";
pub const NUM_DATA_BLOCKS: &str = "num_data_blocks";
pub const NUM_PROVIDERS: &str = "num_providers";
pub const MAX_NESTING_DEPTH: &str = "max_nesting_depth";
pub const RESOURCES_PER_FILE: &str = "resources_per_file";
pub const AWS_TOKEN_COUNT: &str = "aws_token_count";
pub const IAM_COUNT: &str = "iam_count";
pub const EC2_COUNT: &str = "ec2_count";
pub const S3_COUNT: &str = "s3_count";
pub const RDS_COUNT: &str = "rds_count";
pub const LAMBDA_COUNT: &str = "lambda_count";
pub const PUBLIC_INGRESS_COUNT: &str = "public_ingress_count";
pub const PUBLIC_IP_SIGNAL_COUNT: &str = "public_ip_signal_count";

pub const ALL_FEATURES: [&str; 17] = [
    NUM_FILES,
    NUM_RESOURCES,
    NUM_MODULES,
    NUM_VARIABLES,
    NUM_OUTPUTS,
    NUM_DATA_BLOCKS,
    NUM_PROVIDERS,
    MAX_NESTING_DEPTH,
    RESOURCES_PER_FILE,
    AWS_TOKEN_COUNT,
    IAM_COUNT,
    EC2_COUNT,
    S3_COUNT,
    RDS_COUNT,
    LAMBDA_COUNT,
    PUBLIC_INGRESS_COUNT,
    PUBLIC_IP_SIGNAL_COUNT,
];

/// Features the outlier bound is enforced on unless configured otherwise.
pub const DEFAULT_MONITORED: [&str; 7] = [
    NUM_FILES,
    NUM_RESOURCES,
    NUM_MODULES,
    NUM_VARIABLES,
    NUM_OUTPUTS,
    NUM_DATA_BLOCKS,
    AWS_TOKEN_COUNT,
];

const EC2_PREFIXES: &[&str] = &[
    "aws_instance",
    "aws_launch_",
    "aws_autoscaling_",
    "aws_ec2_",
    "aws_spot_",
];
const RDS_PREFIXES: &[&str] = &["aws_db_", "aws_rds_"];

static PUBLIC_CIDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""(0\.0\.0\.0/0|::/0)""#).expect("valid regex"));

static PUBLIC_IP_FLAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\b(associate_public_ip_address|map_public_ip_on_launch|publicly_accessible)",
        r"\s*=\s*true\b"
    ))
    .expect("valid regex")
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(BTreeMap<String, f64>);

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compute every feature in [`ALL_FEATURES`]. Files that do not parse
    /// contribute to text counts only.
    pub fn extract(files: &[SnapshotFile]) -> Self {
        let docs: Vec<HclDocument> = files
            .iter()
            .filter_map(|f| hcl::parse(&f.content).ok())
            .collect();
        Self::from_parts(files, &docs)
    }

    fn from_parts(files: &[SnapshotFile], docs: &[HclDocument]) -> Self {
        let mut resources = 0usize;
        let mut modules = 0usize;
        let mut variables = 0usize;
        let mut outputs = 0usize;
        let mut data_blocks = 0usize;
        let mut max_depth = 0usize;
        let mut providers: BTreeSet<String> = BTreeSet::new();
        let mut resource_types: Vec<&str> = Vec::new();

        for doc in docs {
            max_depth = max_depth.max(doc.max_depth);
            for block in &doc.blocks {
                match block.kind.as_str() {
                    "resource" => {
                        resources += 1;
                        if let Some(ty) = block.label(0) {
                            resource_types.push(ty);
                            providers.insert(provider_of(ty).to_string());
                        }
                    }
                    "data" => {
                        data_blocks += 1;
                        if let Some(ty) = block.label(0) {
                            providers.insert(provider_of(ty).to_string());
                        }
                    }
                    "provider" => {
                        if let Some(name) = block.label(0) {
                            providers.insert(name.to_string());
                        }
                    }
                    "module" => modules += 1,
                    "variable" => variables += 1,
                    "output" => outputs += 1,
                    _ => {}
                }
            }
        }

        let count_types = |prefixes: &[&str]| {
            resource_types
                .iter()
                .filter(|ty| prefixes.iter().any(|p| ty.starts_with(p)))
                .count() as f64
        };

        let mut aws_tokens = 0usize;
        let mut public_ingress = 0usize;
        let mut public_ip = 0usize;
        for file in files {
            aws_tokens += file.content.matches("aws_").count();
            public_ingress += PUBLIC_CIDR.find_iter(&file.content).count();
            public_ip += PUBLIC_IP_FLAG.find_iter(&file.content).count();
        }
        public_ip += resource_types.iter().filter(|ty| **ty == "aws_eip").count();

        let num_files = files.len();
        let resources_per_file = if num_files == 0 {
            0.0
        } else {
            resources as f64 / num_files as f64
        };

        let mut fv = Self::new();
        fv.insert(NUM_FILES, num_files as f64);
        fv.insert(NUM_RESOURCES, resources as f64);
        fv.insert(NUM_MODULES, modules as f64);
        fv.insert(NUM_VARIABLES, variables as f64);
        fv.insert(NUM_OUTPUTS, outputs as f64);
        fv.insert(NUM_DATA_BLOCKS, data_blocks as f64);
        fv.insert(NUM_PROVIDERS, providers.len() as f64);
        fv.insert(MAX_NESTING_DEPTH, max_depth as f64);
        fv.insert(RESOURCES_PER_FILE, resources_per_file);
        fv.insert(AWS_TOKEN_COUNT, aws_tokens as f64);
        fv.insert(IAM_COUNT, count_types(&["aws_iam_"]));
        fv.insert(EC2_COUNT, count_types(EC2_PREFIXES));
        fv.insert(S3_COUNT, count_types(&["aws_s3_"]));
        fv.insert(RDS_COUNT, count_types(RDS_PREFIXES));
        fv.insert(LAMBDA_COUNT, count_types(&["aws_lambda_"]));
        fv.insert(PUBLIC_INGRESS_COUNT, public_ingress as f64);
        fv.insert(PUBLIC_IP_SIGNAL_COUNT, public_ip as f64);
        fv
    }
}

impl FromIterator<(String, f64)> for FeatureVector {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// `aws_s3_bucket` -> `aws`.
pub fn provider_of(resource_type: &str) -> &str {
    resource_type
        .split_once('_')
        .map(|(provider, _)| provider)
        .unwrap_or(resource_type)
}
