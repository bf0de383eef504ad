//! Progress snapshots

use super::NzbDownloader;
use crate::error::{Error, Result};
use crate::queue::FileCounters;
use crate::types::{ArchiveId, ArchiveState, ArchiveStatus, FileStatus, StatusSnapshot};
use std::sync::atomic::Ordering;

impl NzbDownloader {
    /// Snapshot of every known archive, all pools, and the aggregate speed
    pub async fn status(&self) -> StatusSnapshot {
        let ids: Vec<ArchiveId> = {
            let archives = self.registry.archives.lock().await;
            let mut ids: Vec<ArchiveId> = archives.keys().copied().collect();
            ids.sort();
            ids
        };

        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(status) = self.archive_status(id).await {
                statuses.push(status);
            }
        }

        let pools = {
            let pools = self.pools.lock().await;
            pools.iter().map(|p| p.stats().snapshot()).collect()
        };

        StatusSnapshot {
            archives: statuses,
            pools,
            speed_bps: self.controls.speed_bps.load(Ordering::Relaxed),
            queued_bytes: self.queue.queued_bytes().await,
            paused: *self.controls.pause_tx.borrow(),
        }
    }

    /// Progress of a single archive, with a per-file breakdown.
    ///
    /// Live archives read their byte counters from the queue; terminal ones
    /// use the archive-level counters captured when they left it (per-file
    /// bookkeeping is released with the queue entry, so `files` is empty).
    pub async fn archive_status(&self, id: ArchiveId) -> Result<ArchiveStatus> {
        let (name, state, total_bytes, final_read, final_skipped) = {
            let archives = self.registry.archives.lock().await;
            let entry = archives.get(&id).ok_or(Error::ArchiveNotFound { id })?;
            (
                entry.name.clone(),
                entry.state,
                entry.total_bytes,
                entry.final_read_bytes,
                entry.final_skipped_bytes,
            )
        };

        let (read_bytes, skipped_bytes, files) = match self.queue.archive_counters(id).await {
            Some(c) => {
                let files = c.files.iter().map(file_status).collect();
                (c.read_bytes, c.skipped_bytes, files)
            }
            None => (final_read, final_skipped, Vec::new()),
        };

        let percent = match state {
            ArchiveState::Finished => 100.0,
            _ if total_bytes == 0 => 0.0,
            _ => {
                let done = (read_bytes + skipped_bytes).min(total_bytes);
                (done as f64 / total_bytes as f64 * 100.0) as f32
            }
        };

        Ok(ArchiveStatus {
            id,
            name,
            state,
            total_bytes,
            read_bytes,
            skipped_bytes,
            percent,
            files,
        })
    }
}

fn file_status(c: &FileCounters) -> FileStatus {
    let percent = if c.total_bytes == 0 {
        100.0
    } else {
        let done = (c.read_bytes + c.skipped_bytes).min(c.total_bytes);
        (done as f64 / c.total_bytes as f64 * 100.0) as f32
    };
    FileStatus {
        file: c.file,
        filename: c.filename.clone(),
        total_bytes: c.total_bytes,
        read_bytes: c.read_bytes,
        skipped_bytes: c.skipped_bytes,
        percent,
    }
}
