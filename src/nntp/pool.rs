//! Connection pool — one straight-line worker task per configured connection
//!
//! Each worker owns its socket and runs the same loop: wait for work, make
//! sure a session is up, select the group, fetch the body, hand the raw
//! article to the decode stage. Failures never kill a worker; transient ones
//! requeue the claim and reconnect under backoff, authoritative missing
//! verdicts route through the queue's failover bookkeeping.

use crate::config::{RetryConfig, ServerConfig};
use crate::error::{NntpError, QueueError};
use crate::model::ClaimedSegment;
use crate::nntp::connection::NntpConnection;
use crate::queue::SegmentQueue;
use crate::retry::Backoff;
use crate::speed_limiter::SpeedLimiter;
use crate::types::{ArchiveId, PoolId, PoolStatus, SegmentKey};
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A fetched article on its way to the decode stage
#[derive(Debug)]
pub struct DecodeJob {
    /// The pool whose connection fetched the article (for requeueing when a
    /// downstream write fails)
    pub pool: PoolId,
    /// The claim this article satisfies
    pub claim: ClaimedSegment,
    /// Raw dot-unstuffed body; empty for placeholders
    pub body: Vec<u8>,
    /// Bytes read off the wire for this fetch
    pub read_bytes: u64,
    /// True when every pool failed the segment and a zero-byte placeholder
    /// must be written instead of decoded data
    pub placeholder: bool,
}

/// Out-of-band escalation from a pool to the coordinator
#[derive(Debug)]
pub enum PoolNotice {
    /// No pool carries the file's group; the archive cannot proceed
    ArchiveUnreachable {
        /// The archive that cannot be served
        archive: ArchiveId,
        /// Segment whose group exhausted every pool
        key: SegmentKey,
        /// The last group tried
        group: String,
    },
}

/// Gauges shared by a pool's workers for status reporting
#[derive(Debug)]
pub struct PoolStats {
    name: String,
    connected: AtomicUsize,
    active: AtomicUsize,
}

impl PoolStats {
    fn new(name: String) -> Self {
        Self {
            name,
            connected: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        }
    }

    /// Snapshot for status output
    pub fn snapshot(&self) -> PoolStatus {
        PoolStatus {
            name: self.name.clone(),
            active_connections: self.active.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
        }
    }
}

/// All worker tasks for one configured server
pub struct ConnectionPool {
    stats: Arc<PoolStats>,
    handles: Vec<JoinHandle<()>>,
}

impl ConnectionPool {
    /// Spawn `server.connections` workers pulling from `queue` as pool `pool`
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        pool: PoolId,
        server: ServerConfig,
        retry: RetryConfig,
        queue: SegmentQueue,
        limiter: SpeedLimiter,
        decode_tx: mpsc::Sender<DecodeJob>,
        notice_tx: mpsc::Sender<PoolNotice>,
        pause: watch::Receiver<bool>,
        cancel: CancellationToken,
        active_timeout: Duration,
    ) -> Self {
        let stats = Arc::new(PoolStats::new(server.name.clone()));
        let server = Arc::new(server);
        let server_limiter = server.speed_limit_bps.map(|bps| SpeedLimiter::new(Some(bps)));

        let handles = (0..server.connections)
            .map(|index| {
                let worker = Worker {
                    pool,
                    index,
                    server: Arc::clone(&server),
                    retry: retry.clone(),
                    queue: queue.clone(),
                    limiter: limiter.clone(),
                    server_limiter: server_limiter.clone(),
                    decode_tx: decode_tx.clone(),
                    notice_tx: notice_tx.clone(),
                    pause: pause.clone(),
                    cancel: cancel.clone(),
                    stats: Arc::clone(&stats),
                    active_timeout,
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self { stats, handles }
    }

    /// Shared gauges for status snapshots
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for every worker to finish (after the cancel token fires)
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

struct Worker {
    pool: PoolId,
    index: u32,
    server: Arc<ServerConfig>,
    retry: RetryConfig,
    queue: SegmentQueue,
    limiter: SpeedLimiter,
    server_limiter: Option<SpeedLimiter>,
    decode_tx: mpsc::Sender<DecodeJob>,
    notice_tx: mpsc::Sender<PoolNotice>,
    pause: watch::Receiver<bool>,
    cancel: CancellationToken,
    stats: Arc<PoolStats>,
    active_timeout: Duration,
}

impl Worker {
    async fn run(mut self) {
        tracing::debug!(pool = %self.server.name, index = self.index, "connection worker started");
        let mut backoff = Backoff::new(&self.retry);
        let mut conn: Option<NntpConnection> = None;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.wait_unpaused().await {
                break;
            }

            // Register for the queue's nudge before the emptiness check:
            // notify_waiters carries no permit, so a requeue landing between
            // an empty answer and the wait would otherwise be lost.
            let notify = self.queue.work_notify();
            let mut notified = pin!(notify.notified());
            notified.as_mut().enable();

            let claim = match self.queue.get_for_pool(self.pool).await {
                Ok(claim) => claim,
                Err(QueueError::Empty | QueueError::EmptyForPool { .. }) => {
                    if !self.idle_wait(&mut conn, notified).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!(pool = %self.server.name, error = %e, "queue error");
                    break;
                }
            };

            if !self.ensure_connected(&mut conn, &mut backoff, &claim).await {
                break;
            }

            self.stats.active.fetch_add(1, Ordering::Relaxed);
            let keep = self.process_claim(&mut conn, &mut backoff, claim).await;
            self.stats.active.fetch_sub(1, Ordering::Relaxed);
            if !keep {
                break;
            }
        }

        if let Some(c) = conn.take() {
            self.stats.connected.fetch_sub(1, Ordering::Relaxed);
            c.quit().await;
        }
        tracing::debug!(pool = %self.server.name, index = self.index, "connection worker stopped");
    }

    /// Fetch one claimed segment. Returns false when the worker should exit.
    async fn process_claim(
        &self,
        conn_slot: &mut Option<NntpConnection>,
        backoff: &mut Backoff,
        claim: ClaimedSegment,
    ) -> bool {
        if !self.server.skip_group_command {
            let selected = match conn_slot.as_mut() {
                Some(c) => c.select_group(&claim.groups).await,
                None => return true,
            };
            match selected {
                Ok(()) => {}
                Err(NntpError::GroupUnavailable { group, code }) => {
                    tracing::warn!(
                        pool = %self.server.name,
                        segment = %claim.key,
                        group = %group,
                        code,
                        "no usable group on this pool"
                    );
                    return self.handle_missing(claim, Some(group)).await;
                }
                Err(e) => {
                    return self.handle_transient(conn_slot, backoff, claim, e).await;
                }
            }
        }

        let fetched = match conn_slot.as_mut() {
            Some(c) => c.fetch_body(&claim.message_id).await,
            None => return true,
        };
        match fetched {
            Ok((body, read_bytes)) => {
                backoff.reset();
                if let Some(limiter) = &self.server_limiter {
                    limiter.acquire(read_bytes).await;
                }
                tracing::debug!(
                    pool = %self.server.name,
                    segment = %claim.key,
                    read_bytes,
                    "segment fetched"
                );
                self.decode_tx
                    .send(DecodeJob {
                        pool: self.pool,
                        claim,
                        body,
                        read_bytes,
                        placeholder: false,
                    })
                    .await
                    .is_ok()
            }
            Err(NntpError::ArticleMissing { code, .. }) => {
                tracing::warn!(
                    pool = %self.server.name,
                    segment = %claim.key,
                    message_id = %claim.message_id,
                    code,
                    "article missing on this pool"
                );
                self.handle_missing(claim, None).await
            }
            Err(e) => self.handle_transient(conn_slot, backoff, claim, e).await,
        }
    }

    /// Record an authoritative per-pool failure and decide what happens when
    /// no pool remains: a group failure escalates to the coordinator, a
    /// missing article degrades to a zero-byte placeholder.
    async fn handle_missing(&self, claim: ClaimedSegment, missing_group: Option<String>) -> bool {
        match self.queue.requeue_missing(self.pool, &claim).await {
            Ok(()) => true,
            Err(QueueError::PoolsExhausted { key, message_id }) => match missing_group {
                Some(group) => self
                    .notice_tx
                    .send(PoolNotice::ArchiveUnreachable {
                        archive: claim.archive,
                        key,
                        group,
                    })
                    .await
                    .is_ok(),
                None => {
                    tracing::warn!(
                        segment = %key,
                        message_id = %message_id,
                        "article missing on every pool, writing placeholder"
                    );
                    self.decode_tx
                        .send(DecodeJob {
                            pool: self.pool,
                            claim,
                            body: Vec::new(),
                            read_bytes: 0,
                            placeholder: true,
                        })
                        .await
                        .is_ok()
                }
            },
            Err(_) => true,
        }
    }

    /// Requeue the claim, drop the session, and sleep out the backoff.
    /// Returns false when canceled during the sleep.
    async fn handle_transient(
        &self,
        conn_slot: &mut Option<NntpConnection>,
        backoff: &mut Backoff,
        claim: ClaimedSegment,
        error: NntpError,
    ) -> bool {
        tracing::warn!(
            pool = %self.server.name,
            segment = %claim.key,
            error = %error,
            "fetch failed, requeueing and reconnecting"
        );
        self.queue.requeue(self.pool, &claim).await;
        if conn_slot.take().is_some() {
            self.stats.connected.fetch_sub(1, Ordering::Relaxed);
        }
        let delay = backoff.next_delay();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Make sure a session exists, reconnecting under backoff forever.
    ///
    /// Returns false only on cancellation; the claim is returned to the queue
    /// in that case.
    async fn ensure_connected(
        &self,
        conn: &mut Option<NntpConnection>,
        backoff: &mut Backoff,
        claim: &ClaimedSegment,
    ) -> bool {
        while conn.is_none() {
            match NntpConnection::connect(&self.server, self.limiter.clone(), self.active_timeout)
                .await
            {
                Ok(new_conn) => {
                    tracing::info!(
                        pool = %self.server.name,
                        index = self.index,
                        host = %self.server.host,
                        "connected"
                    );
                    self.stats.connected.fetch_add(1, Ordering::Relaxed);
                    *conn = Some(new_conn);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        pool = %self.server.name,
                        index = self.index,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "connect failed, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.queue.requeue(self.pool, claim).await;
                            return false;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        true
    }

    /// Block while the coordinator holds the global pause (disk full or user
    /// pause). Returns false when the pause channel is gone or we're canceled.
    async fn wait_unpaused(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            result = self.pause.wait_for(|paused| !*paused) => result.is_ok(),
        }
    }

    /// Nothing claimable right now: sleep until the queue stirs, pinging the
    /// server if idleness approaches the server-side cutoff.
    ///
    /// `notified` must have been enabled before the queue reported empty.
    async fn idle_wait(
        &self,
        conn: &mut Option<NntpConnection>,
        notified: Pin<&mut Notified<'_>>,
    ) -> bool {
        let anti_idle = Duration::from_secs(self.server.anti_idle_secs.max(1));
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = notified => true,
            _ = tokio::time::sleep(anti_idle) => {
                if let Some(c) = conn.as_mut()
                    && let Err(e) = c.anti_idle().await
                {
                    tracing::debug!(
                        pool = %self.server.name,
                        error = %e,
                        "anti-idle ping failed, dropping session"
                    );
                    if conn.take().is_some() {
                        self.stats.connected.fetch_sub(1, Ordering::Relaxed);
                    }
                }
                true
            }
        }
    }
}
