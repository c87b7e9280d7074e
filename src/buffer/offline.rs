use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::fs;
use tokio::sync::Mutex;

use crate::buffer::sample::Sample;
use crate::utils::error::AgentError;

pub const OFFLINE_BUFFER_FILE: &str = "offline-buffer.json";

/// Disk-backed spill queue: a single JSON array rewritten in full on each
/// append, through a temp file + rename so a crash never leaves a torn file.
///
/// Ingest is toggled with the control-channel state; `add_data_points` while
/// not buffering is silently ignored. The bulk uploader's spill path
/// (`spill`) bypasses the toggle because an upload can fail while the
/// channel itself is up.
pub struct OfflineBuffer {
    path: PathBuf,
    max_bytes: u64,
    buffering: AtomicBool,
    record_count: AtomicUsize,
    io_lock: Mutex<()>,
}

impl OfflineBuffer {
    pub fn new<P: AsRef<Path>>(buffer_dir: P, max_bytes: u64) -> Result<Self, AgentError> {
        let dir = buffer_dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            AgentError::BufferError(format!(
                "Failed to create buffer directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = dir.join(OFFLINE_BUFFER_FILE);
        let existing = match std::fs::read_to_string(&path) {
            Ok(content) if !content.trim().is_empty() => {
                serde_json::from_str::<Vec<Sample>>(&content)
                    .map(|records| records.len())
                    .unwrap_or_else(|e| {
                        warn!("⚠️  Offline buffer file is corrupt, starting fresh: {}", e);
                        0
                    })
            }
            _ => 0,
        };
        if existing > 0 {
            info!(
                "💾 Offline buffer holds {} records from a previous run ({})",
                existing,
                path.display()
            );
        }

        Ok(Self {
            path,
            max_bytes,
            buffering: AtomicBool::new(false),
            record_count: AtomicUsize::new(existing),
            io_lock: Mutex::new(()),
        })
    }

    pub fn set_buffering(&self, buffering: bool) {
        let was = self.buffering.swap(buffering, Ordering::SeqCst);
        if was != buffering {
            if buffering {
                info!("💾 Offline buffering ENABLED (cloud channel down)");
            } else {
                info!("📡 Offline buffering disabled (cloud channel up)");
            }
        }
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::SeqCst)
    }

    /// Polling-path ingest, gated by the buffering toggle.
    pub async fn add_data_points(&self, samples: &[Sample]) -> Result<usize, AgentError> {
        if !self.is_buffering() {
            debug!("Offline buffer not active, ignoring {} samples", samples.len());
            return Ok(0);
        }
        self.append(samples).await
    }

    /// Upload-failure path: append regardless of the toggle so a failed
    /// ingest POST never loses its batch.
    pub async fn spill(&self, samples: &[Sample]) -> Result<usize, AgentError> {
        self.append(samples).await
    }

    async fn append(&self, samples: &[Sample]) -> Result<usize, AgentError> {
        if samples.is_empty() {
            return Ok(0);
        }
        let _guard = self.io_lock.lock().await;

        let mut records = self.read_records().await?;
        records.extend_from_slice(samples);

        let mut payload = serde_json::to_vec(&records)
            .map_err(|e| AgentError::BufferError(format!("Failed to serialize buffer: {}", e)))?;

        // Soft size cap: shed the oldest records until the file fits.
        let mut total_dropped = 0usize;
        while payload.len() as u64 > self.max_bytes && !records.is_empty() {
            let drop = (records.len() / 10).max(1);
            records.drain(..drop);
            total_dropped += drop;
            payload = serde_json::to_vec(&records).map_err(|e| {
                AgentError::BufferError(format!("Failed to serialize buffer: {}", e))
            })?;
        }
        if total_dropped > 0 {
            warn!(
                "⚠️  Offline buffer over {} bytes: dropped {} oldest records",
                self.max_bytes, total_dropped
            );
        }

        self.write_atomic(&payload).await?;
        self.record_count.store(records.len(), Ordering::SeqCst);
        debug!(
            "💾 Offline buffer now holds {} records ({} bytes)",
            records.len(),
            payload.len()
        );
        Ok(samples.len().saturating_sub(total_dropped.min(samples.len())))
    }

    pub async fn get_buffered_data(&self) -> Result<Vec<Sample>, AgentError> {
        let _guard = self.io_lock.lock().await;
        self.read_records().await
    }

    /// Truncate after a fully successful drain. All-or-nothing: callers must
    /// only invoke this once every chunk uploaded.
    pub async fn clear_buffer(&self) -> Result<(), AgentError> {
        let _guard = self.io_lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AgentError::BufferError(format!(
                    "Failed to clear offline buffer: {}",
                    e
                )))
            }
        }
        self.record_count.store(0, Ordering::SeqCst);
        info!("🗑️  Offline buffer cleared");
        Ok(())
    }

    pub fn get_record_count(&self) -> usize {
        self.record_count.load(Ordering::SeqCst)
    }

    pub async fn get_size(&self) -> u64 {
        fs::metadata(&self.path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0)
    }

    async fn read_records(&self) -> Result<Vec<Sample>, AgentError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AgentError::BufferError(format!(
                    "Failed to read offline buffer: {}",
                    e
                )))
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str(&content) {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!("⚠️  Offline buffer file is corrupt, discarding: {}", e);
                Ok(Vec::new())
            }
        }
    }

    async fn write_atomic(&self, payload: &[u8]) -> Result<(), AgentError> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload)
            .await
            .map_err(|e| AgentError::BufferError(format!("Failed to write buffer file: {}", e)))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AgentError::BufferError(format!("Failed to swap buffer file: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(register_id: &str, value: u16) -> Sample {
        Sample::good("dev-1", register_id, value, "2026-01-01T00:00:00.000Z")
    }

    #[tokio::test]
    async fn test_append_and_drain_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = OfflineBuffer::new(dir.path(), 50 * 1024 * 1024).unwrap();
        buffer.set_buffering(true);

        buffer.add_data_points(&[sample("r1", 1)]).await.unwrap();
        buffer
            .add_data_points(&[sample("r2", 2), sample("r3", 3)])
            .await
            .unwrap();

        assert_eq!(buffer.get_record_count(), 3);
        let records = buffer.get_buffered_data().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].register_id, "r1");
        assert_eq!(records[2].register_id, "r3");

        buffer.clear_buffer().await.unwrap();
        assert_eq!(buffer.get_record_count(), 0);
        assert!(buffer.get_buffered_data().await.unwrap().is_empty());
        assert_eq!(buffer.get_size().await, 0);
    }

    #[tokio::test]
    async fn test_ingest_ignored_while_not_buffering() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = OfflineBuffer::new(dir.path(), 50 * 1024 * 1024).unwrap();

        let added = buffer.add_data_points(&[sample("r1", 1)]).await.unwrap();
        assert_eq!(added, 0);
        assert_eq!(buffer.get_record_count(), 0);

        // The upload-failure path is not gated.
        buffer.spill(&[sample("r1", 1)]).await.unwrap();
        assert_eq!(buffer.get_record_count(), 1);
    }

    #[tokio::test]
    async fn test_reloads_count_from_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        {
            let buffer = OfflineBuffer::new(dir.path(), 50 * 1024 * 1024).unwrap();
            buffer.spill(&[sample("r1", 1), sample("r2", 2)]).await.unwrap();
        }
        let reopened = OfflineBuffer::new(dir.path(), 50 * 1024 * 1024).unwrap();
        assert_eq!(reopened.get_record_count(), 2);
    }

    #[tokio::test]
    async fn test_size_cap_sheds_oldest() {
        let dir = tempfile::tempdir().unwrap();
        // Cap small enough that 100 samples cannot all fit.
        let buffer = OfflineBuffer::new(dir.path(), 2_000).unwrap();
        let samples: Vec<Sample> = (0..100).map(|i| sample(&format!("r{}", i), i as u16)).collect();
        buffer.spill(&samples).await.unwrap();

        let records = buffer.get_buffered_data().await.unwrap();
        assert!(records.len() < 100);
        assert_eq!(records.last().unwrap().register_id, "r99", "newest kept");
        assert!(buffer.get_size().await <= 2_000);
    }
}
