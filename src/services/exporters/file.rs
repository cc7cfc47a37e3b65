//! File exporter with size/age rotation, for archival
//!
//! Records are appended as JSON lines. The active file rotates to
//! `<path>.<unix-ts>` when it exceeds the size cap or outlives the age cap.

use super::Exporter;
use crate::config::FileExporterConfig;
use crate::models::Record;
use crate::utils::{CollectorError, CollectorResult};
use async_trait::async_trait;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct ActiveFile {
    writer: BufWriter<File>,
    bytes_written: u64,
    opened: Instant,
}

pub struct FileExporter {
    path: PathBuf,
    rotate_max_bytes: u64,
    rotate_max_age: Duration,
    active: Mutex<Option<ActiveFile>>,
}

impl FileExporter {
    pub fn new(config: &FileExporterConfig) -> Self {
        Self {
            path: PathBuf::from(&config.path),
            rotate_max_bytes: config.rotate_max_bytes,
            rotate_max_age: Duration::from_secs(config.rotate_max_age_secs),
            active: Mutex::new(None),
        }
    }

    fn write_batch(&self, batch: &[Record]) -> CollectorResult<()> {
        let mut guard = self.active.lock().expect("file exporter poisoned");

        let rotation_due = guard
            .as_ref()
            .map(|active| {
                active.bytes_written >= self.rotate_max_bytes
                    || active.opened.elapsed() >= self.rotate_max_age
            })
            .unwrap_or(false);
        if rotation_due {
            // Close before renaming so buffered lines land in the old file
            drop(guard.take());
            self.rotate()?;
        }

        if guard.is_none() {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CollectorError::export_failed("file", format!("create {:?}: {}", parent, e))
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| CollectorError::export_failed("file", format!("open {:?}: {}", self.path, e)))?;
            let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);
            *guard = Some(ActiveFile {
                writer: BufWriter::new(file),
                bytes_written,
                opened: Instant::now(),
            });
        }

        let active = guard.as_mut().expect("active file set above");
        for record in batch {
            let line = serde_json::to_string(record)
                .map_err(|e| CollectorError::export_failed("file", format!("encode: {}", e)))?;
            active
                .writer
                .write_all(line.as_bytes())
                .and_then(|_| active.writer.write_all(b"\n"))
                .map_err(|e| CollectorError::export_failed("file", format!("write: {}", e)))?;
            active.bytes_written += line.len() as u64 + 1;
        }
        active
            .writer
            .flush()
            .map_err(|e| CollectorError::export_failed("file", format!("flush: {}", e)))?;

        Ok(())
    }

    fn rotate(&self) -> CollectorResult<()> {
        let rotated = self
            .path
            .with_extension(format!("jsonl.{}", Utc::now().timestamp()));
        std::fs::rename(&self.path, &rotated).map_err(|e| {
            CollectorError::export_failed("file", format!("rotate {:?}: {}", self.path, e))
        })?;
        tracing::info!("Rotated telemetry archive to {:?}", rotated);
        Ok(())
    }
}

#[async_trait]
impl Exporter for FileExporter {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn export(&self, batch: &[Record]) -> CollectorResult<()> {
        self.write_batch(batch)
    }

    async fn shutdown(&self) {
        if let Some(active) = self.active.lock().expect("file exporter poisoned").as_mut()
            && let Err(e) = active.writer.flush()
        {
            tracing::warn!("Failed to flush telemetry archive on shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseKind, Source};

    fn records(n: usize) -> Vec<Record> {
        let source = Source::new(DatabaseKind::Postgres, "db1:5432", "orders");
        (0..n).map(|i| Record::gauge(source.clone(), format!("m{}", i), i as f64)).collect()
    }

    fn exporter(dir: &std::path::Path, max_bytes: u64) -> FileExporter {
        FileExporter::new(&FileExporterConfig {
            enabled: true,
            path: dir.join("telemetry.jsonl").to_string_lossy().to_string(),
            rotate_max_bytes: max_bytes,
            rotate_max_age_secs: 3600,
            queue_size: 16,
        })
    }

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(dir.path(), 1024 * 1024);

        exporter.export(&records(3)).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("telemetry.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: Record = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.metric_name(), Some("m0"));
    }

    #[tokio::test]
    async fn test_rotation_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter(dir.path(), 64); // tiny cap forces rotation

        exporter.export(&records(2)).await.unwrap();
        exporter.export(&records(2)).await.unwrap();

        let rotated: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("jsonl."))
            .collect();
        assert!(!rotated.is_empty(), "expected a rotated archive file");
    }
}
