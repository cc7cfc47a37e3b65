//! File-backed sending queue
//!
//! Batches that exhaust their retry budget are spilled to a spool directory
//! as append-only JSON segment files and replayed on the next startup. The
//! spool is compacted (merged into a single segment) on startup and
//! shutdown. When the segment cap is reached the oldest segments are
//! dropped, with a single warning per period.

use crate::models::Record;
use crate::utils::{CollectorError, CollectorResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const SEGMENT_PREFIX: &str = "segment-";
const DROP_WARN_PERIOD_SECS: u64 = 60;

pub struct SpoolQueue {
    dir: PathBuf,
    max_segments: usize,
    seq: AtomicU64,
    last_drop_warning: Mutex<Option<Instant>>,
}

impl SpoolQueue {
    pub fn open(dir: impl Into<PathBuf>, max_segments: usize) -> CollectorResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| CollectorError::internal_error(format!("spool dir {:?}: {}", dir, e)))?;
        let queue = Self {
            dir,
            max_segments: max_segments.max(1),
            seq: AtomicU64::new(0),
            last_drop_warning: Mutex::new(None),
        };
        // Continue numbering after whatever survived the last run
        if let Some(max_seq) = queue.segments()?.iter().filter_map(|p| segment_seq(p)).max() {
            queue.seq.store(max_seq + 1, Ordering::Relaxed);
        }
        Ok(queue)
    }

    /// Persist one batch as a new segment
    pub fn append(&self, batch: &[Record]) -> CollectorResult<()> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("{}{:016}.json", SEGMENT_PREFIX, seq));
        let payload = serde_json::to_vec(batch)
            .map_err(|e| CollectorError::internal_error(format!("spool encode: {}", e)))?;
        fs::write(&path, payload)
            .map_err(|e| CollectorError::internal_error(format!("spool write {:?}: {}", path, e)))?;

        self.enforce_cap()?;
        Ok(())
    }

    /// All segments oldest-first
    pub fn segments(&self) -> CollectorResult<Vec<PathBuf>> {
        let mut segments: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(|e| CollectorError::internal_error(format!("spool read {:?}: {}", self.dir, e)))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(SEGMENT_PREFIX) && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        segments.sort();
        Ok(segments)
    }

    /// Load one segment's batch
    pub fn read_segment(&self, path: &Path) -> CollectorResult<Vec<Record>> {
        let bytes = fs::read(path)
            .map_err(|e| CollectorError::internal_error(format!("spool read {:?}: {}", path, e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CollectorError::internal_error(format!("spool decode {:?}: {}", path, e)))
    }

    pub fn remove_segment(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!("Failed to remove spool segment {:?}: {}", path, e);
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments().map(|s| s.len()).unwrap_or(0)
    }

    /// Merge every pending segment into one; corrupt segments are dropped
    pub fn compact(&self) -> CollectorResult<()> {
        let segments = self.segments()?;
        if segments.len() <= 1 {
            return Ok(());
        }

        let mut merged: Vec<Record> = Vec::new();
        for path in &segments {
            match self.read_segment(path) {
                Ok(batch) => merged.extend(batch),
                Err(e) => tracing::warn!("Dropping corrupt spool segment {:?}: {}", path, e),
            }
        }

        self.append(&merged)?;
        for path in &segments {
            self.remove_segment(path);
        }

        tracing::info!(
            "Compacted {} spool segments into one ({} records)",
            segments.len(),
            merged.len()
        );
        Ok(())
    }

    fn enforce_cap(&self) -> CollectorResult<()> {
        let segments = self.segments()?;
        if segments.len() <= self.max_segments {
            return Ok(());
        }

        let excess = segments.len() - self.max_segments;
        for path in segments.iter().take(excess) {
            self.remove_segment(path);
        }

        let mut last = self.last_drop_warning.lock().expect("spool warn poisoned");
        let warn = match *last {
            Some(at) => at.elapsed().as_secs() >= DROP_WARN_PERIOD_SECS,
            None => true,
        };
        if warn {
            *last = Some(Instant::now());
            tracing::warn!("Spool at capacity, dropped {} oldest segment(s)", excess);
        }
        Ok(())
    }
}

fn segment_seq(path: &Path) -> Option<u64> {
    path.file_stem()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .parse()
        .ok()
}
