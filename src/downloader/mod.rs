//! The download coordinator: archive lifecycle, worker wiring, status
//!
//! [`NzbDownloader`] is the crate's front door. It owns nothing directly;
//! every field is Arc-backed so the handle clones cheaply into the spawned
//! worker tasks. The impl is split by concern: `control` holds
//! pause/resume/cancel/shutdown, `pipeline` the decode workers, disk-full
//! guard, and assembly hand-off, and `status` the progress snapshots.

mod control;
mod pipeline;
mod status;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::Nzb;
use crate::nntp::ConnectionPool;
use crate::nzb::ManifestParser;
use crate::queue::SegmentQueue;
use crate::speed_limiter::SpeedLimiter;
use crate::types::{ArchiveId, ArchiveState, Event, PoolId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Coordinator-side record of one archive
pub(crate) struct ArchiveEntry {
    pub(crate) name: String,
    pub(crate) state: ArchiveState,
    pub(crate) total_bytes: u64,
    pub(crate) dest_dir: PathBuf,
    /// Fires when the archive is canceled; assembly checks it cooperatively
    pub(crate) cancel: CancellationToken,
    /// Final byte counters, filled in when the archive leaves the queue
    pub(crate) final_read_bytes: u64,
    pub(crate) final_skipped_bytes: u64,
}

/// Archive bookkeeping shared across handle clones
#[derive(Clone)]
pub(crate) struct ArchiveRegistry {
    pub(crate) archives: Arc<Mutex<HashMap<ArchiveId, ArchiveEntry>>>,
    pub(crate) next_id: Arc<AtomicU64>,
    pub(crate) accepting_new: Arc<AtomicBool>,
}

/// Runtime control surface: the pause gate, shutdown token, speed counters
#[derive(Clone)]
pub(crate) struct Controls {
    /// Gate the pool workers block on; true while downloading is suspended
    pub(crate) pause_tx: Arc<watch::Sender<bool>>,
    pub(crate) user_paused: Arc<AtomicBool>,
    pub(crate) disk_paused: Arc<AtomicBool>,
    pub(crate) shutdown: CancellationToken,
    /// Wire bytes read since start, fed by the decode stage
    pub(crate) wire_bytes: Arc<AtomicU64>,
    /// Last measured aggregate speed
    pub(crate) speed_bps: Arc<AtomicU64>,
}

impl Controls {
    /// Recompute the pause gate from the user and disk flags
    pub(crate) fn update_pause_gate(&self) {
        let paused = self.user_paused.load(Ordering::Relaxed)
            || self.disk_paused.load(Ordering::Relaxed);
        self.pause_tx.send_replace(paused);
    }
}

/// Multi-server NZB downloader (cloneable handle; all clones share state)
#[derive(Clone)]
pub struct NzbDownloader {
    pub(crate) config: Arc<Config>,
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) queue: SegmentQueue,
    pub(crate) speed_limiter: SpeedLimiter,
    pub(crate) registry: ArchiveRegistry,
    pub(crate) controls: Controls,
    pub(crate) pools: Arc<Mutex<Vec<ConnectionPool>>>,
    started: Arc<AtomicBool>,
}

impl NzbDownloader {
    /// Validate the configuration and build an idle downloader.
    ///
    /// Nothing connects or spawns until [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(256);
        let (pause_tx, _) = watch::channel(false);
        let speed_limiter = SpeedLimiter::new(config.download.speed_limit_bps);
        let queue = SegmentQueue::new(config.servers.len());

        Ok(Self {
            config: Arc::new(config),
            event_tx,
            queue,
            speed_limiter,
            registry: ArchiveRegistry {
                archives: Arc::new(Mutex::new(HashMap::new())),
                next_id: Arc::new(AtomicU64::new(1)),
                accepting_new: Arc::new(AtomicBool::new(true)),
            },
            controls: Controls {
                pause_tx: Arc::new(pause_tx),
                user_paused: Arc::new(AtomicBool::new(false)),
                disk_paused: Arc::new(AtomicBool::new(false)),
                shutdown: CancellationToken::new(),
                wire_bytes: Arc::new(AtomicU64::new(0)),
                speed_bps: Arc::new(AtomicU64::new(0)),
            },
            pools: Arc::new(Mutex::new(Vec::new())),
            started: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Spawn the connection pools, decode workers, and background tasks.
    ///
    /// Safe to call once; later calls are no-ops.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.config.download.working_dir).await?;
        tokio::fs::create_dir_all(&self.config.download.dest_dir).await?;

        let (decode_tx, decode_rx) = mpsc::channel(64);
        let (notice_tx, notice_rx) = mpsc::channel(16);
        let active_timeout = Duration::from_secs(self.config.download.active_timeout_secs);

        {
            let mut pools = self.pools.lock().await;
            for (index, server) in self.config.servers.iter().enumerate() {
                pools.push(ConnectionPool::spawn(
                    PoolId(index),
                    server.clone(),
                    self.config.retry.clone(),
                    self.queue.clone(),
                    self.speed_limiter.clone(),
                    decode_tx.clone(),
                    notice_tx.clone(),
                    self.controls.pause_tx.subscribe(),
                    self.controls.shutdown.clone(),
                    active_timeout,
                ));
            }
        }
        // Workers hold the only senders; when the pools stop, the decode
        // stage drains and exits on its own.
        drop(decode_tx);
        drop(notice_tx);

        let decode_rx = Arc::new(Mutex::new(decode_rx));
        for _ in 0..self.config.download.decode_workers.max(1) {
            tokio::spawn(pipeline::decode_worker(self.clone(), Arc::clone(&decode_rx)));
        }
        tokio::spawn(pipeline::notice_task(self.clone(), notice_rx));
        tokio::spawn(pipeline::speed_ticker(self.clone()));

        tracing::info!(
            servers = self.config.servers.len(),
            decode_workers = self.config.download.decode_workers,
            "downloader started"
        );
        Ok(())
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Parse an NZB manifest file and queue it for download
    pub async fn add_nzb_file(&self, path: impl AsRef<Path>) -> Result<ArchiveId> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("archive")
            .to_string();
        self.add_nzb(&name, &content, path.to_path_buf()).await
    }

    /// Parse an NZB manifest from memory and queue it for download
    pub async fn add_nzb_str(&self, name: &str, content: &str) -> Result<ArchiveId> {
        self.add_nzb(name, content, PathBuf::new()).await
    }

    async fn add_nzb(
        &self,
        name: &str,
        content: &str,
        manifest_path: PathBuf,
    ) -> Result<ArchiveId> {
        if !self.registry.accepting_new.load(Ordering::Relaxed) {
            return Err(Error::ShuttingDown);
        }

        let files = ManifestParser::new().parse(content.as_bytes())?;
        let id = ArchiveId::new(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        let total_bytes = files.iter().map(|f| f.total_bytes).sum();
        let dest_dir = self.config.download.dest_dir.clone();

        let nzb = Nzb {
            id,
            manifest_path,
            archive_name: name.to_string(),
            dest_dir: dest_dir.clone(),
            total_bytes,
            read_bytes: 0,
            skipped_bytes: 0,
            files,
        };

        self.registry.archives.lock().await.insert(
            id,
            ArchiveEntry {
                name: name.to_string(),
                state: ArchiveState::Idle,
                total_bytes,
                dest_dir,
                cancel: self.controls.shutdown.child_token(),
                final_read_bytes: 0,
                final_skipped_bytes: 0,
            },
        );
        self.queue.add_nzb(nzb).await;
        self.emit(Event::ArchiveQueued {
            id,
            name: name.to_string(),
            total_bytes,
        });
        Ok(id)
    }

    /// Broadcast an event; no subscribers is fine
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }
}
