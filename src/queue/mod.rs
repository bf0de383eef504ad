//! Segment queue — priority dispatch and failover routing for download work
//!
//! One coarse mutex guards the whole queue state: the archive arena, the main
//! priority heap, the retry queue, and the per-file bookkeeping sets. Mutation
//! frequency is bounded by network round-trips, so contention is negligible
//! and the single lock keeps the cross-pool invariants easy to reason about.
//!
//! The central invariant: at any instant a segment is in exactly one of
//! {main heap, retry bucket, claimed by one connection, decoded on disk}.
//! Claims are exclusive because claiming pops the heap entry; a claim is
//! returned to the queue only through `requeue`/`requeue_missing`, and both
//! are no-ops for segments that have already been decoded.

mod retry;

use crate::error::QueueError;
use crate::model::{ClaimedSegment, Nzb};
use crate::types::{ArchiveId, PoolId, SegmentKey};
use retry::RetryQueue;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// One entry in the priority heap or a retry bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuedSegment {
    pub(crate) priority: u64,
    pub(crate) seq: u64,
    pub(crate) archive: ArchiveId,
    pub(crate) key: SegmentKey,
}

// Reversed ordering so std's max-heap behaves as a min-priority queue;
// equal priorities fall back to insertion order (lower seq first).
impl Ord for QueuedSegment {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedSegment {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Everything the assembler needs once a file's last segment decodes
#[derive(Debug, Clone)]
pub struct AssemblyJob {
    /// Which archive
    pub archive: ArchiveId,
    /// File index within the archive
    pub file: usize,
    /// Archive name (for temp-name construction)
    pub archive_name: String,
    /// Name segment files were written under
    pub working_name: String,
    /// Destination directory for the assembled file
    pub dest_dir: PathBuf,
    /// Segment numbers in assembly order
    pub segment_numbers: Vec<u32>,
}

/// Result of marking a segment decoded
#[derive(Debug, Default)]
pub struct SegmentOutcome {
    /// Set when this was the file's last outstanding segment
    pub assembly: Option<AssemblyJob>,
    /// True when another decode already produced this on-disk path
    pub duplicate_write: bool,
}

/// Rename plan produced when a decoded header resolves a provisional filename
#[derive(Debug, Clone)]
pub struct FileRename {
    /// The provisional working name segment files were written under
    pub old_working_name: String,
    /// The resolved filename to rename them to
    pub new_name: String,
}

/// Per-archive byte counters for status reporting
#[derive(Debug, Clone)]
pub struct ArchiveCounters {
    /// Archive name
    pub name: String,
    /// Destination directory
    pub dest_dir: PathBuf,
    /// Sum of declared segment sizes
    pub total_bytes: u64,
    /// Bytes read off the wire
    pub read_bytes: u64,
    /// Declared bytes of dequeued segments
    pub skipped_bytes: u64,
    /// Per-file byte counters, in manifest order
    pub files: Vec<FileCounters>,
}

/// Byte counters for one file of an archive
#[derive(Debug, Clone)]
pub struct FileCounters {
    /// File index within the archive
    pub file: usize,
    /// The name segment files are currently written under
    pub filename: String,
    /// Sum of the file's declared segment sizes
    pub total_bytes: u64,
    /// Bytes read off the wire for this file
    pub read_bytes: u64,
    /// Declared bytes of the file's dequeued segments
    pub skipped_bytes: u64,
}

/// Remnants of a canceled archive, for on-disk cleanup
#[derive(Debug)]
pub struct CanceledArchive {
    /// Archive name
    pub archive_name: String,
    /// Working names of files that may have segment files on disk
    pub working_names: Vec<String>,
}

#[derive(Debug)]
struct QueueInner {
    archives: HashMap<ArchiveId, Nzb>,
    heap: BinaryHeap<QueuedSegment>,
    retry: RetryQueue,
    /// Files with segments still referenced by the queue; emptiness per
    /// archive is the archive-completion criterion
    files_in_queue: HashSet<(ArchiveId, usize)>,
    /// Decoded-segment paths already produced, to catch duplicate writes
    on_disk: HashMap<PathBuf, (ArchiveId, SegmentKey)>,
    /// Archives whose segments are parked in place (pause without dequeue)
    paused: HashSet<ArchiveId>,
    queued_bytes: u64,
    seq: u64,
}

/// A heap/retry entry is live iff its segment is still awaiting download
fn segment_is_live(archives: &HashMap<ArchiveId, Nzb>, entry: &QueuedSegment) -> bool {
    archives
        .get(&entry.archive)
        .and_then(|nzb| nzb.files.get(entry.key.file))
        .map(|file| {
            file.todo_segments.contains(&entry.key.number)
                && !file.dequeued_segments.contains(&entry.key.number)
        })
        .unwrap_or(false)
}

impl QueueInner {
    fn entry_is_live(&self, entry: &QueuedSegment) -> bool {
        segment_is_live(&self.archives, entry)
    }

    fn failed_mask(&self, entry: &QueuedSegment) -> u32 {
        self.archives
            .get(&entry.archive)
            .and_then(|nzb| nzb.files.get(entry.key.file))
            .and_then(|file| file.segment(entry.key.number))
            .map(|s| s.failed_pools)
            .unwrap_or(0)
    }

    fn claim(&self, entry: &QueuedSegment) -> Option<ClaimedSegment> {
        let nzb = self.archives.get(&entry.archive)?;
        let file = nzb.files.get(entry.key.file)?;
        let segment = file.segment(entry.key.number)?;
        Some(ClaimedSegment {
            archive: entry.archive,
            key: entry.key,
            message_id: segment.message_id.clone(),
            groups: file.groups.clone(),
            bytes: segment.bytes,
            priority: segment.priority,
        })
    }
}

/// Thread-safe segment queue shared by every connection and decode worker.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SegmentQueue {
    inner: Arc<Mutex<QueueInner>>,
    /// Woken whenever new work appears (requeue, add, resume), so starved
    /// pools never busy-poll
    notify: Arc<Notify>,
    pool_count: usize,
}

impl SegmentQueue {
    /// Create a queue for a fixed set of pools
    pub fn new(pool_count: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                archives: HashMap::new(),
                heap: BinaryHeap::new(),
                retry: RetryQueue::new(),
                files_in_queue: HashSet::new(),
                on_disk: HashMap::new(),
                paused: HashSet::new(),
                queued_bytes: 0,
                seq: 0,
            })),
            notify: Arc::new(Notify::new()),
            pool_count,
        }
    }

    /// Handle used by connections to wait for new work without polling
    pub fn work_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Register an archive and enqueue all of its segments
    pub async fn add_nzb(&self, nzb: Nzb) {
        let mut inner = self.inner.lock().await;
        let id = nzb.id;
        for (file_idx, file) in nzb.files.iter().enumerate() {
            inner.files_in_queue.insert((id, file_idx));
            for segment in &file.segments {
                inner.seq += 1;
                let entry = QueuedSegment {
                    priority: segment.priority,
                    seq: inner.seq,
                    archive: id,
                    key: SegmentKey {
                        file: file_idx,
                        number: segment.number,
                    },
                };
                inner.heap.push(entry);
                inner.queued_bytes += segment.bytes;
            }
        }
        tracing::info!(
            archive_id = id.0,
            name = %nzb.archive_name,
            files = nzb.files.len(),
            total_bytes = nzb.total_bytes,
            "archive enqueued"
        );
        inner.archives.insert(id, nzb);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Claim the next segment for a pool: retry work this pool has not failed
    /// first, then the main heap.
    ///
    /// `Err(EmptyForPool)` means other pools still have retry work parked;
    /// `Err(Empty)` means nothing remains anywhere.
    pub async fn get_for_pool(&self, pool: PoolId) -> Result<ClaimedSegment, QueueError> {
        let mut inner = self.inner.lock().await;

        // Entries of paused archives get popped, stashed, and put back; they
        // keep their place without being handed out.
        let mut retry_stash: Vec<(u32, QueuedSegment)> = Vec::new();
        let mut heap_stash: Vec<QueuedSegment> = Vec::new();

        let mut claimed = None;

        // Retry queue first so failed-over segments jump ahead of fresh work
        while let Some(entry) = inner.retry.pop_for_pool(pool) {
            if !inner.entry_is_live(&entry) {
                continue;
            }
            if inner.paused.contains(&entry.archive) {
                let mask = inner.failed_mask(&entry);
                retry_stash.push((mask, entry));
                continue;
            }
            if let Some(claim) = inner.claim(&entry) {
                claimed = Some(claim);
                break;
            }
        }

        if claimed.is_none() {
            while let Some(entry) = inner.heap.pop() {
                if !inner.entry_is_live(&entry) {
                    continue;
                }
                if inner.paused.contains(&entry.archive) {
                    heap_stash.push(entry);
                    continue;
                }
                if let Some(claim) = inner.claim(&entry) {
                    claimed = Some(claim);
                    break;
                }
            }
        }

        for (mask, entry) in retry_stash {
            inner.retry.push(mask, entry);
        }
        for entry in heap_stash {
            inner.heap.push(entry);
        }

        match claimed {
            Some(claim) => Ok(claim),
            None => {
                // Buckets carrying this pool's bit were never visited above,
                // so dead entries (canceled or decoded) may linger there and
                // must not masquerade as parked work for other pools.
                let QueueInner {
                    archives, retry, ..
                } = &mut *inner;
                retry.retain_live(|entry| segment_is_live(archives, entry));
                if retry.is_empty() {
                    Err(QueueError::Empty)
                } else {
                    Err(QueueError::EmptyForPool { pool })
                }
            }
        }
    }

    /// Park or release an archive's queued segments in place.
    ///
    /// Paused segments stay in the heap and retry buckets but are never
    /// handed to a pool; in-flight claims are unaffected and finish normally.
    pub async fn set_archive_paused(&self, archive: ArchiveId, paused: bool) {
        let mut inner = self.inner.lock().await;
        if paused {
            inner.paused.insert(archive);
        } else {
            inner.paused.remove(&archive);
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// The name the file's segment files are written under right now
    pub async fn segment_write_name(&self, archive: ArchiveId, file: usize) -> Option<String> {
        let inner = self.inner.lock().await;
        let nzb = inner.archives.get(&archive)?;
        let f = nzb.files.get(file)?;
        Some(f.working_name(&nzb.archive_name))
    }

    /// Put a claimed segment back after a transient, non-authoritative failure
    /// (disconnect, timeout). Routes into the retry queue when the segment has
    /// prior authoritative failures so other pools find it preferentially.
    ///
    /// No-op for segments that have already been decoded or dequeued, making
    /// requeue-after-late-failure idempotent.
    pub async fn requeue(&self, pool: PoolId, claim: &ClaimedSegment) {
        let mut inner = self.inner.lock().await;
        let entry = QueuedSegment {
            priority: claim.priority,
            seq: {
                inner.seq += 1;
                inner.seq
            },
            archive: claim.archive,
            key: claim.key,
        };
        if !inner.entry_is_live(&entry) {
            tracing::debug!(
                archive_id = claim.archive.0,
                segment = %claim.key,
                "requeue ignored: segment no longer pending"
            );
            return;
        }
        let failed_mask = inner
            .archives
            .get(&claim.archive)
            .and_then(|nzb| nzb.files.get(claim.key.file))
            .and_then(|file| file.segment(claim.key.number))
            .map(|s| s.failed_pools)
            .unwrap_or(0);

        if failed_mask != 0 {
            inner.retry.push(failed_mask, entry);
        } else {
            inner.heap.push(entry);
        }
        tracing::debug!(
            archive_id = claim.archive.0,
            segment = %claim.key,
            pool = pool.0,
            "segment requeued after transient failure"
        );
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Record an authoritative missing-article failure for `pool` and park the
    /// segment for the remaining pools.
    ///
    /// Fails with [`QueueError::PoolsExhausted`] once every pool has failed
    /// it; the caller must then write a zero-byte placeholder and move on.
    pub async fn requeue_missing(
        &self,
        pool: PoolId,
        claim: &ClaimedSegment,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let entry = QueuedSegment {
            priority: claim.priority,
            seq: {
                inner.seq += 1;
                inner.seq
            },
            archive: claim.archive,
            key: claim.key,
        };
        if !inner.entry_is_live(&entry) {
            return Ok(());
        }

        let pool_count = self.pool_count;
        let Some(segment) = inner
            .archives
            .get_mut(&claim.archive)
            .and_then(|nzb| nzb.files.get_mut(claim.key.file))
            .and_then(|file| file.segment_mut(claim.key.number))
        else {
            return Ok(());
        };

        segment.failed_pools |= pool.bit();
        let mask = segment.failed_pools;
        if mask.count_ones() as usize >= pool_count {
            tracing::error!(
                archive_id = claim.archive.0,
                segment = %claim.key,
                message_id = %claim.message_id,
                "segment failed on all pools"
            );
            return Err(QueueError::PoolsExhausted {
                key: claim.key,
                message_id: claim.message_id.clone(),
            });
        }

        inner.retry.push(mask, entry);
        tracing::warn!(
            archive_id = claim.archive.0,
            segment = %claim.key,
            pool = pool.0,
            failed_pools = mask.count_ones(),
            "article missing on pool, parked for other pools"
        );
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Mark a segment decoded and written to `decoded_path`.
    ///
    /// Adjusts byte accounting, records the path in the on-disk index, and
    /// returns an [`AssemblyJob`] when this was the file's last segment.
    pub async fn segment_done(
        &self,
        claim: &ClaimedSegment,
        decoded_path: PathBuf,
        read_bytes: u64,
    ) -> SegmentOutcome {
        let mut inner = self.inner.lock().await;

        let duplicate_write = {
            let previous = inner
                .on_disk
                .insert(decoded_path.clone(), (claim.archive, claim.key));
            if let Some((prev_archive, prev_key)) = previous {
                tracing::warn!(
                    path = %decoded_path.display(),
                    first = %prev_key,
                    second = %claim.key,
                    archive_id = prev_archive.0,
                    "duplicate decoded-segment write detected"
                );
                true
            } else {
                false
            }
        };

        let Some(nzb) = inner.archives.get_mut(&claim.archive) else {
            return SegmentOutcome {
                assembly: None,
                duplicate_write,
            };
        };
        nzb.read_bytes += read_bytes;
        let archive_name = nzb.archive_name.clone();
        let dest_dir = nzb.dest_dir.clone();
        let Some(file) = nzb.files.get_mut(claim.key.file) else {
            return SegmentOutcome {
                assembly: None,
                duplicate_write,
            };
        };
        file.read_bytes += read_bytes;

        if !file.todo_segments.remove(&claim.key.number) {
            // Already decoded by an earlier claim; nothing further to do
            return SegmentOutcome {
                assembly: None,
                duplicate_write,
            };
        }
        let assembly = file.is_all_segments_decoded().then(|| AssemblyJob {
            archive: claim.archive,
            file: claim.key.file,
            archive_name: archive_name.clone(),
            working_name: file.working_name(&archive_name),
            dest_dir,
            segment_numbers: file.segments.iter().map(|s| s.number).collect(),
        });
        inner.queued_bytes = inner.queued_bytes.saturating_sub(claim.bytes);

        SegmentOutcome {
            assembly,
            duplicate_write,
        }
    }

    /// Resolve a file's provisional filename from a decoded encoding header.
    ///
    /// Returns a rename plan when the file was still using its temp name;
    /// None when the name was already known (subject-line discovery) or the
    /// archive is gone.
    pub async fn resolve_filename(
        &self,
        archive: ArchiveId,
        file: usize,
        name: &str,
    ) -> Option<FileRename> {
        let mut inner = self.inner.lock().await;
        let nzb = inner.archives.get_mut(&archive)?;
        let archive_name = nzb.archive_name.clone();
        let file = nzb.files.get_mut(file)?;
        if file.filename.is_some() {
            return None;
        }
        let old_working_name = file.temp_filename(&archive_name);
        file.filename = Some(name.to_string());
        tracing::info!(
            archive_id = archive.0,
            old = %old_working_name,
            new = %name,
            "resolved filename from decoded header"
        );
        Some(FileRename {
            old_working_name,
            new_name: name.to_string(),
        })
    }

    /// Remove an assembled file from the queue's bookkeeping.
    ///
    /// Returns true when this was the archive's last referenced file.
    pub async fn file_done(&self, archive: ArchiveId, file: usize) -> bool {
        let mut inner = self.inner.lock().await;
        inner.files_in_queue.remove(&(archive, file));
        inner
            .on_disk
            .retain(|_, (a, key)| !(*a == archive && key.file == file));
        let archive_done = !inner.files_in_queue.iter().any(|(a, _)| *a == archive);
        if archive_done {
            tracing::info!(archive_id = archive.0, "all files done");
        }
        archive_done
    }

    /// Dequeue a par file's remaining segments without downloading them
    /// (recovery blocks that are not currently needed).
    pub async fn skip_par_file(&self, archive: ArchiveId, file: usize) {
        let mut inner = self.inner.lock().await;
        let Some(nzb) = inner.archives.get_mut(&archive) else {
            return;
        };
        let Some(f) = nzb.files.get_mut(file) else {
            return;
        };
        f.is_skipped_par = true;
        let moved: Vec<u32> = f.todo_segments.drain().collect();
        let mut skipped = 0u64;
        for number in &moved {
            f.dequeued_segments.insert(*number);
            skipped += f.segment(*number).map(|s| s.bytes).unwrap_or(0);
        }
        nzb.skipped_bytes += skipped;
        inner.queued_bytes = inner.queued_bytes.saturating_sub(skipped);
        // A fully skipped file no longer holds the archive open
        inner.files_in_queue.remove(&(archive, file));
        tracing::info!(
            archive_id = archive.0,
            file,
            segments = moved.len(),
            skipped_bytes = skipped,
            "par file dequeued without download"
        );
    }

    /// Return a skipped par file's segments to the download queue (par
    /// recovery decided it needs them after all).
    pub async fn unskip_par_file(&self, archive: ArchiveId, file: usize) {
        let mut inner = self.inner.lock().await;
        let Some(nzb) = inner.archives.get_mut(&archive) else {
            return;
        };
        let Some(f) = nzb.files.get_mut(file) else {
            return;
        };
        f.is_skipped_par = false;
        let restored: Vec<(u32, u64, u64)> = f
            .dequeued_segments
            .drain()
            .filter_map(|n| f.segments.iter().find(|s| s.number == n))
            .map(|s| (s.number, s.priority, s.bytes))
            .collect();
        let mut restored_bytes = 0u64;
        for (number, _priority, bytes) in &restored {
            f.todo_segments.insert(*number);
            restored_bytes += bytes;
        }
        nzb.skipped_bytes = nzb.skipped_bytes.saturating_sub(restored_bytes);
        for (number, priority, _bytes) in &restored {
            inner.seq += 1;
            let entry = QueuedSegment {
                priority: *priority,
                seq: inner.seq,
                archive,
                key: SegmentKey {
                    file,
                    number: *number,
                },
            };
            inner.heap.push(entry);
        }
        inner.queued_bytes += restored_bytes;
        inner.files_in_queue.insert((archive, file));
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Remove an archive and everything it still holds in the queue.
    ///
    /// Heap and retry entries for the archive die lazily (they fail the
    /// liveness check at pop time). Returns cleanup info, or None when the
    /// archive was not known.
    pub async fn cancel_archive(&self, archive: ArchiveId) -> Option<CanceledArchive> {
        let mut inner = self.inner.lock().await;
        let nzb = inner.archives.remove(&archive)?;
        inner.files_in_queue.retain(|(a, _)| *a != archive);
        inner.on_disk.retain(|_, (a, _)| *a != archive);
        inner.paused.remove(&archive);

        let mut remaining = 0u64;
        let mut working_names = Vec::with_capacity(nzb.files.len());
        for file in &nzb.files {
            working_names.push(file.working_name(&nzb.archive_name));
            for segment in &file.segments {
                if file.todo_segments.contains(&segment.number) {
                    remaining += segment.bytes;
                }
            }
        }
        inner.queued_bytes = inner.queued_bytes.saturating_sub(remaining);
        drop(inner);
        // Wake idle connections so they observe the queue shrinking
        self.notify.notify_waiters();
        Some(CanceledArchive {
            archive_name: nzb.archive_name,
            working_names,
        })
    }

    /// Per-archive byte counters for status output, with a per-file breakdown
    pub async fn archive_counters(&self, archive: ArchiveId) -> Option<ArchiveCounters> {
        let inner = self.inner.lock().await;
        inner.archives.get(&archive).map(|nzb| ArchiveCounters {
            name: nzb.archive_name.clone(),
            dest_dir: nzb.dest_dir.clone(),
            total_bytes: nzb.total_bytes,
            read_bytes: nzb.read_bytes,
            skipped_bytes: nzb.skipped_bytes,
            files: nzb
                .files
                .iter()
                .enumerate()
                .map(|(idx, file)| FileCounters {
                    file: idx,
                    filename: file.working_name(&nzb.archive_name),
                    total_bytes: file.total_bytes,
                    read_bytes: file.read_bytes,
                    skipped_bytes: file.skipped_bytes(),
                })
                .collect(),
        })
    }

    /// Bytes still represented in the queue, across all archives
    pub async fn queued_bytes(&self) -> u64 {
        self.inner.lock().await.queued_bytes
    }

    /// Drop all state (graceful shutdown)
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.archives.clear();
        inner.heap.clear();
        inner.retry.clear();
        inner.files_in_queue.clear();
        inner.on_disk.clear();
        inner.paused.clear();
        inner.queued_bytes = 0;
        drop(inner);
        self.notify.notify_waiters();
    }
}
