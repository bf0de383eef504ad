//! Archive and downloader control operations

use super::NzbDownloader;
use crate::assembler::cleanup_working_files;
use crate::error::{Error, Result};
use crate::queue::CanceledArchive;
use crate::types::{ArchiveId, ArchiveState, Event};
use std::sync::atomic::Ordering;

impl NzbDownloader {
    /// Pause one archive. Its queued segments stay in place but are no longer
    /// handed to connections; segments already in flight finish normally.
    pub async fn pause(&self, id: ArchiveId) -> Result<()> {
        {
            let mut archives = self.registry.archives.lock().await;
            let entry = archives.get_mut(&id).ok_or(Error::ArchiveNotFound { id })?;
            match entry.state {
                ArchiveState::Idle | ArchiveState::Downloading => {
                    entry.state = ArchiveState::Paused;
                }
                ArchiveState::Paused => {
                    return Err(Error::AlreadyInState {
                        id,
                        state: "paused".to_string(),
                    });
                }
                state => {
                    return Err(Error::InvalidState {
                        id,
                        operation: "pause".to_string(),
                        current_state: state.to_string(),
                    });
                }
            }
        }
        self.queue.set_archive_paused(id, true).await;
        tracing::info!(archive_id = id.0, "archive paused");
        self.emit(Event::ArchivePaused { id });
        Ok(())
    }

    /// Resume a paused archive
    pub async fn resume(&self, id: ArchiveId) -> Result<()> {
        {
            let mut archives = self.registry.archives.lock().await;
            let entry = archives.get_mut(&id).ok_or(Error::ArchiveNotFound { id })?;
            match entry.state {
                ArchiveState::Paused => {
                    entry.state = ArchiveState::Downloading;
                }
                ArchiveState::Idle | ArchiveState::Downloading => {
                    return Err(Error::AlreadyInState {
                        id,
                        state: "downloading".to_string(),
                    });
                }
                state => {
                    return Err(Error::InvalidState {
                        id,
                        operation: "resume".to_string(),
                        current_state: state.to_string(),
                    });
                }
            }
        }
        self.queue.set_archive_paused(id, false).await;
        tracing::info!(archive_id = id.0, "archive resumed");
        self.emit(Event::ArchiveResumed { id });
        Ok(())
    }

    /// Cancel an archive: purge its queued segments, signal in-flight work to
    /// stop, and delete its working files. Idempotent; canceling a finished or
    /// already-canceled archive is a no-op.
    pub async fn cancel(&self, id: ArchiveId) -> Result<()> {
        {
            let mut archives = self.registry.archives.lock().await;
            let entry = archives.get_mut(&id).ok_or(Error::ArchiveNotFound { id })?;
            if entry.state.is_terminal() {
                return Ok(());
            }
            entry.state = ArchiveState::Canceled;
            entry.cancel.cancel();
        }
        self.purge_archive(id).await;
        tracing::info!(archive_id = id.0, "archive canceled");
        self.emit(Event::ArchiveCanceled { id });
        Ok(())
    }

    /// Pause every archive at once (operator-level stop). Connections stay
    /// open; the fetch loop blocks on the gate.
    pub fn pause_all(&self) {
        self.controls.user_paused.store(true, Ordering::Relaxed);
        self.controls.update_pause_gate();
        tracing::info!("downloading paused");
    }

    /// Release an operator-level pause. Downloading stays gated if a disk-full
    /// pause is still in effect.
    pub fn resume_all(&self) {
        self.controls.user_paused.store(false, Ordering::Relaxed);
        self.controls.update_pause_gate();
        tracing::info!("downloading resumed");
    }

    /// Gracefully shut down: stop accepting archives, cancel all workers, and
    /// wait for every connection to close.
    pub async fn shutdown(&self) {
        self.registry.accepting_new.store(false, Ordering::Relaxed);
        self.controls.shutdown.cancel();
        // Wake anything parked on the pause gate so it can observe the cancel
        self.controls.pause_tx.send_replace(false);

        let pools = std::mem::take(&mut *self.pools.lock().await);
        for pool in pools {
            pool.join().await;
        }
        self.queue.clear().await;
        tracing::info!("downloader shut down");
        self.emit(Event::Shutdown);
    }

    /// Fatally fail an archive (unreachable group, unrecoverable assembly
    /// error). Same teardown as a cancel, different event.
    pub(crate) async fn fail_archive(&self, id: ArchiveId, error: String) {
        {
            let mut archives = self.registry.archives.lock().await;
            let Some(entry) = archives.get_mut(&id) else {
                return;
            };
            if entry.state.is_terminal() {
                return;
            }
            entry.state = ArchiveState::Canceled;
            entry.cancel.cancel();
        }
        self.purge_archive(id).await;
        tracing::error!(archive_id = id.0, error = %error, "archive failed");
        self.emit(Event::ArchiveFailed { id, error });
    }

    /// Remove an archive from the queue, record its final byte counters, and
    /// delete its leftover working files.
    async fn purge_archive(&self, id: ArchiveId) {
        if let Some(counters) = self.queue.archive_counters(id).await {
            let mut archives = self.registry.archives.lock().await;
            if let Some(entry) = archives.get_mut(&id) {
                entry.final_read_bytes = counters.read_bytes;
                entry.final_skipped_bytes = counters.skipped_bytes;
            }
        }
        if let Some(canceled) = self.queue.cancel_archive(id).await {
            self.remove_working_files(id, canceled).await;
        }
    }

    /// Delete an archive's leftover segment files on the blocking pool
    pub(super) async fn remove_working_files(&self, id: ArchiveId, canceled: CanceledArchive) {
        let working_dir = self.config.download.working_dir.clone();
        let result = tokio::task::spawn_blocking(move || {
            cleanup_working_files(&working_dir, &canceled.working_names);
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(archive_id = id.0, error = %e, "working-file cleanup task failed");
        }
    }
}
