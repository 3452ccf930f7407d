//! Dataset output: record assembly, the NDJSON writers and dataset statistics.

pub mod ndjson;
pub mod record;
pub mod stats;

pub use ndjson::{DatasetWriter, NdjsonWriter};
pub use record::{DatasetRecord, ProvenanceRecorder, RecordedFile, RejectRecord, SCHEMA_VERSION};
pub use stats::{DatasetStats, FeatureSummary};
