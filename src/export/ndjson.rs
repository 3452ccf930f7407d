//! Append-only newline-delimited JSON streams.
//!
//! Each record is serialized to a single line, written and flushed before
//! `append` returns. Existing lines are never rewritten; reopening an existing
//! file continues after its last line.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::record::DatasetRecord;
use crate::error::OutputError;

struct Inner {
    file: File,
    lines: u64,
}

/// Single exclusive writer for one NDJSON file.
pub struct NdjsonWriter {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl NdjsonWriter {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OutputError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| OutputError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(open_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(open_err)?;

        Ok(Self {
            path,
            inner: Mutex::new(Inner { file, lines: 0 }),
        })
    }

    pub async fn append<T: Serialize>(&self, value: &T) -> Result<(), OutputError> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');

        let mut inner = self.inner.lock().await;
        let write_err = |source| OutputError::Write {
            path: self.path.clone(),
            source,
        };
        inner.file.write_all(line.as_bytes()).await.map_err(write_err)?;
        inner.file.flush().await.map_err(write_err)?;
        inner.lines += 1;
        Ok(())
    }

    /// Lines written by this writer (not counting pre-existing ones).
    pub async fn lines_written(&self) -> u64 {
        self.inner.lock().await.lines
    }
}

/// The dataset output: only schema-valid records reach the file.
pub struct DatasetWriter {
    inner: NdjsonWriter,
}

impl DatasetWriter {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OutputError> {
        Ok(Self {
            inner: NdjsonWriter::open(path).await?,
        })
    }

    pub async fn write(&self, record: &DatasetRecord) -> Result<(), OutputError> {
        record.validate()?;
        self.inner.append(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn appends_one_line_per_record_and_preserves_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.ndjson");

        let writer = NdjsonWriter::open(&path).await.unwrap();
        writer.append(&json!({"n": 1})).await.unwrap();
        writer.append(&json!({"text": "multi\nline"})).await.unwrap();
        drop(writer);

        let writer = NdjsonWriter::open(&path).await.unwrap();
        writer.append(&json!({"n": 3})).await.unwrap();
        assert_eq!(writer.lines_written().await, 1);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines, vec![r#"{"n":1}"#, r#"{"text":"multi\nline"}"#, r#"{"n":3}"#]);
    }

    #[tokio::test]
    async fn concurrent_appends_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ndjson");
        let writer = Arc::new(NdjsonWriter::open(&path).await.unwrap());

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let writer = writer.clone();
                tokio::spawn(async move {
                    writer
                        .append(&json!({"worker": i, "pad": "x".repeat(4096)}))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut seen: Vec<i64> = contents
            .lines()
            .map(|l| {
                let value: serde_json::Value = serde_json::from_str(l).unwrap();
                value["worker"].as_i64().unwrap()
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unwritable_destination_is_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let err = NdjsonWriter::open(blocker.join("out.ndjson")).await.err().unwrap();
        assert!(matches!(err, OutputError::Open { .. }));
    }
}
