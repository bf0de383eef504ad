//! The decode/write/assemble pipeline and the coordinator's background tasks

use super::NzbDownloader;
use crate::assembler::{assemble_file, rename_working_files};
use crate::decoder::{Encoding, decode_article};
use crate::error::AssembleError;
use crate::model::ClaimedSegment;
use crate::nntp::{DecodeJob, PoolNotice};
use crate::queue::{ArchiveCounters, AssemblyJob};
use crate::types::{ArchiveId, ArchiveState, Event, PoolId};
use crate::utils::{get_available_space, is_disk_full};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

enum WriteVerdict {
    Written,
    /// Disk was full; the segment went back to the queue for after the pause
    Requeued,
    Failed(std::io::Error),
}

/// One decode worker: pull fetched articles, decode off the async runtime,
/// write the segment file, and hand completed files to assembly.
///
/// Workers share a single receiver; the stage exits when every pool worker
/// has dropped its sender.
pub(super) async fn decode_worker(dl: NzbDownloader, rx: Arc<Mutex<mpsc::Receiver<DecodeJob>>>) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };
        process_job(&dl, job).await;
    }
    tracing::debug!("decode worker stopped");
}

async fn process_job(dl: &NzbDownloader, job: DecodeJob) {
    let DecodeJob {
        pool,
        claim,
        body,
        read_bytes,
        placeholder,
    } = job;

    let (data, header_filename) = if placeholder {
        (Vec::new(), None)
    } else {
        let decoded = match tokio::task::spawn_blocking(move || decode_article(&body)).await {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::error!(segment = %claim.key, error = %e, "decode task failed");
                return;
            }
        };
        if decoded.encoding == Encoding::Unknown {
            tracing::warn!(
                segment = %claim.key,
                message_id = %claim.message_id,
                "no recognizable encoding, writing empty segment"
            );
        }
        if decoded.crc_ok == Some(false) {
            tracing::warn!(segment = %claim.key, "CRC mismatch in decoded segment");
        }
        if decoded.size_ok == Some(false) {
            tracing::warn!(segment = %claim.key, "decoded size differs from declared size");
        }
        (decoded.data, decoded.filename)
    };

    // A decoded header can reveal the file's real name; segment files written
    // under the provisional name must follow it before this one is placed.
    if let Some(name) = header_filename
        && let Some(rename) = dl
            .queue
            .resolve_filename(claim.archive, claim.key.file, &name)
            .await
    {
        let working_dir = dl.config.download.working_dir.clone();
        let result = tokio::task::spawn_blocking(move || {
            rename_working_files(&working_dir, &rename.old_working_name, &rename.new_name);
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(archive_id = claim.archive.0, error = %e, "rename task failed");
        }
    }

    let Some(working_name) = dl
        .queue
        .segment_write_name(claim.archive, claim.key.file)
        .await
    else {
        // Archive was canceled while this segment was in flight
        tracing::debug!(segment = %claim.key, "dropping segment for removed archive");
        return;
    };
    let path = segment_path(&dl.config.download.working_dir, &working_name, claim.key.number);

    match write_segment_file(dl, pool, &claim, &path, &data).await {
        WriteVerdict::Written => {}
        WriteVerdict::Requeued => return,
        WriteVerdict::Failed(e) => {
            dl.fail_archive(
                claim.archive,
                format!("cannot write segment file {}: {e}", path.display()),
            )
            .await;
            return;
        }
    }

    if placeholder {
        dl.emit(Event::SegmentMissing {
            id: claim.archive,
            key: claim.key,
            message_id: claim.message_id.clone(),
        });
    }
    dl.controls
        .wire_bytes
        .fetch_add(read_bytes, Ordering::Relaxed);
    mark_downloading(dl, claim.archive).await;

    let outcome = dl.queue.segment_done(&claim, path, read_bytes).await;
    if let Some(assembly) = outcome.assembly {
        run_assembly(dl, assembly).await;
    }
}

/// Write one decoded segment. A full disk pauses the whole downloader and
/// sends the segment back to the queue; it is re-fetched once the pause
/// lifts (see the free-space probe in [`speed_ticker`]).
async fn write_segment_file(
    dl: &NzbDownloader,
    pool: PoolId,
    claim: &ClaimedSegment,
    path: &Path,
    data: &[u8],
) -> WriteVerdict {
    let min_free = dl.config.download.min_free_disk_bytes;
    if min_free > 0
        && let Ok(available) = get_available_space(&dl.config.download.working_dir)
        && available < min_free
    {
        enter_disk_pause(dl, claim.archive, path);
        dl.queue.requeue(pool, claim).await;
        return WriteVerdict::Requeued;
    }

    match tokio::fs::write(path, data).await {
        Ok(()) => WriteVerdict::Written,
        Err(e) if is_disk_full(&e) => {
            // The partial artifact is useless
            let _ = tokio::fs::remove_file(path).await;
            enter_disk_pause(dl, claim.archive, path);
            dl.queue.requeue(pool, claim).await;
            WriteVerdict::Requeued
        }
        Err(e) => WriteVerdict::Failed(e),
    }
}

fn enter_disk_pause(dl: &NzbDownloader, id: ArchiveId, path: &Path) {
    if !dl.controls.disk_paused.swap(true, Ordering::Relaxed) {
        dl.controls.update_pause_gate();
        tracing::error!(path = %path.display(), "disk full, pausing all downloads");
        dl.emit(Event::DiskFull {
            id,
            path: path.to_path_buf(),
        });
    }
}

/// Clear the disk pause once the working filesystem has headroom again
fn probe_disk_recovery(dl: &NzbDownloader) {
    if !dl.controls.disk_paused.load(Ordering::Relaxed) {
        return;
    }
    let min_free = dl.config.download.min_free_disk_bytes;
    match get_available_space(&dl.config.download.working_dir) {
        Ok(available) if available >= min_free => {
            if dl.controls.disk_paused.swap(false, Ordering::Relaxed) {
                dl.controls.update_pause_gate();
                tracing::info!(available, "disk space recovered, releasing pause");
            }
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "free-space probe failed");
        }
    }
}

/// Assemble a completed file on the blocking pool and advance the archive
async fn run_assembly(dl: &NzbDownloader, job: AssemblyJob) {
    let id = job.archive;
    let cancel = {
        let archives = dl.registry.archives.lock().await;
        match archives.get(&id) {
            Some(entry) => entry.cancel.clone(),
            None => return,
        }
    };

    let working_dir = dl.config.download.working_dir.clone();
    let filename = job.working_name.clone();
    let file = job.file;
    let task = tokio::task::spawn_blocking(move || assemble_file(&job, &working_dir, &cancel));

    match task.await {
        Ok(Ok(path)) => {
            dl.emit(Event::FileAssembled { id, filename, path });
            if dl.queue.file_done(id, file).await {
                finish_archive(dl, id).await;
            }
        }
        Ok(Err(AssembleError::Canceled)) => {
            tracing::debug!(archive_id = id.0, "assembly aborted by cancellation");
        }
        Ok(Err(e)) => {
            dl.fail_archive(id, format!("assembly failed for {filename}: {e}"))
                .await;
        }
        Err(e) => {
            dl.fail_archive(id, format!("assembly task failed: {e}")).await;
        }
    }
}

async fn finish_archive(dl: &NzbDownloader, id: ArchiveId) {
    let counters = dl.queue.archive_counters(id).await;
    let (name, dest_dir) = {
        let mut archives = dl.registry.archives.lock().await;
        let Some(entry) = archives.get_mut(&id) else {
            return;
        };
        if entry.state.is_terminal() {
            return;
        }
        entry.state = ArchiveState::Finished;
        if let Some(c) = &counters {
            entry.final_read_bytes = c.read_bytes;
            entry.final_skipped_bytes = c.skipped_bytes;
        }
        (entry.name.clone(), entry.dest_dir.clone())
    };
    // All assembled files are on disk; drop the queue-side bookkeeping and
    // sweep segment files left behind by files skipped mid-download.
    if let Some(remnants) = dl.queue.cancel_archive(id).await {
        dl.remove_working_files(id, remnants).await;
    }
    tracing::info!(archive_id = id.0, name = %name, "archive finished");
    dl.emit(Event::ArchiveFinished { id, name, dest_dir });
}

async fn mark_downloading(dl: &NzbDownloader, id: ArchiveId) {
    let mut archives = dl.registry.archives.lock().await;
    if let Some(entry) = archives.get_mut(&id)
        && entry.state == ArchiveState::Idle
    {
        entry.state = ArchiveState::Downloading;
    }
}

/// Escalations from the pools: a group no pool carries is fatal for its archive
pub(super) async fn notice_task(dl: NzbDownloader, mut rx: mpsc::Receiver<PoolNotice>) {
    while let Some(notice) = rx.recv().await {
        match notice {
            PoolNotice::ArchiveUnreachable {
                archive,
                key,
                group,
            } => {
                dl.fail_archive(
                    archive,
                    format!("group {group} unavailable on every server ({key})"),
                )
                .await;
            }
        }
    }
}

/// Once a second: derive the aggregate speed from the wire-byte counter and
/// broadcast per-archive progress.
pub(super) async fn speed_ticker(dl: NzbDownloader) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last = dl.controls.wire_bytes.load(Ordering::Relaxed);

    loop {
        tokio::select! {
            _ = dl.controls.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let now = dl.controls.wire_bytes.load(Ordering::Relaxed);
        let speed = now.saturating_sub(last);
        last = now;
        dl.controls.speed_bps.store(speed, Ordering::Relaxed);
        probe_disk_recovery(&dl);

        let live: Vec<ArchiveId> = {
            let archives = dl.registry.archives.lock().await;
            archives
                .iter()
                .filter(|(_, e)| e.state == ArchiveState::Downloading)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in live {
            if let Some(c) = dl.queue.archive_counters(id).await {
                emit_file_progress(&dl, id, &c, speed);
            }
        }
    }
}

/// One progress event per unfinished file, plus the archive-level percent
fn emit_file_progress(dl: &NzbDownloader, id: ArchiveId, counters: &ArchiveCounters, speed: u64) {
    let archive_percent =
        progress_percent(counters.read_bytes, counters.skipped_bytes, counters.total_bytes);
    for f in &counters.files {
        let percent = progress_percent(f.read_bytes, f.skipped_bytes, f.total_bytes);
        if percent >= 100.0 {
            continue;
        }
        dl.emit(Event::SegmentProgress {
            id,
            file: f.file,
            filename: f.filename.clone(),
            percent,
            archive_percent,
            speed_bps: speed,
        });
    }
}

/// Progress counts skipped (dequeued) bytes as done, so a par-skipped archive
/// can still reach 100%.
fn progress_percent(read_bytes: u64, skipped_bytes: u64, total_bytes: u64) -> f32 {
    if total_bytes == 0 {
        return 100.0;
    }
    let done = (read_bytes + skipped_bytes).min(total_bytes);
    (done as f64 / total_bytes as f64 * 100.0) as f32
}

pub(super) fn segment_path(working_dir: &Path, working_name: &str, number: u32) -> PathBuf {
    working_dir.join(format!("{working_name}.segment{number:04}"))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DownloadConfig, RetryConfig, ServerConfig};
    use crate::downloader::NzbDownloader;
    use crate::nntp::DecodeJob;
    use crate::types::PoolId;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <file poster="p" date="1" subject="demo &quot;payload.bin&quot; (1/2)">
    <groups><group>alt.binaries.test</group></groups>
    <segments>
      <segment bytes="10" number="1">one@example</segment>
      <segment bytes="10" number="2">two@example</segment>
    </segments>
  </file>
</nzb>"#;

    fn downloader_with_min_free(
        working: &TempDir,
        dest: &TempDir,
        min_free_disk_bytes: u64,
    ) -> NzbDownloader {
        let config = Config {
            servers: vec![ServerConfig {
                name: "primary".to_string(),
                host: "news.example.com".to_string(),
                ..Default::default()
            }],
            download: DownloadConfig {
                working_dir: working.path().to_path_buf(),
                dest_dir: dest.path().to_path_buf(),
                min_free_disk_bytes,
                ..Default::default()
            },
            retry: RetryConfig::default(),
        };
        NzbDownloader::new(config).unwrap()
    }

    fn downloader(working: &TempDir, dest: &TempDir) -> NzbDownloader {
        downloader_with_min_free(working, dest, 0)
    }

    #[test]
    fn percent_is_clamped_and_counts_skipped_bytes() {
        assert_eq!(progress_percent(0, 0, 0), 100.0);
        assert_eq!(progress_percent(50, 0, 100), 50.0);
        assert_eq!(progress_percent(50, 50, 100), 100.0);
        assert_eq!(progress_percent(200, 0, 100), 100.0);
    }

    #[test]
    fn segment_path_is_zero_padded() {
        let path = segment_path(Path::new("/w"), "file.bin", 7);
        assert_eq!(path, Path::new("/w/file.bin.segment0007"));
    }

    #[tokio::test]
    async fn yenc_jobs_flow_through_decode_write_and_assembly() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let dl = downloader(&working, &dest);
        let id = dl.add_nzb_str("demo", MANIFEST).await.unwrap();
        let mut events = dl.subscribe();

        for (expected_number, payload) in [(1u32, b"hello".as_slice()), (2, b" world")] {
            let claim = dl.queue.get_for_pool(PoolId(0)).await.unwrap();
            assert_eq!(claim.key.number, expected_number);
            let body = crate::decoder::yenc::encode_for_test("payload.bin", payload, 128);
            process_job(
                &dl,
                DecodeJob {
                    pool: PoolId(0),
                    claim,
                    body,
                    read_bytes: payload.len() as u64,
                    placeholder: false,
                },
            )
            .await;
        }

        let assembled = dest.path().join("payload.bin");
        assert_eq!(std::fs::read(&assembled).unwrap(), b"hello world");

        let mut saw_assembled = false;
        let mut saw_finished = false;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::FileAssembled { id: got, .. } => {
                    assert_eq!(got, id);
                    saw_assembled = true;
                }
                Event::ArchiveFinished { id: got, .. } => {
                    assert_eq!(got, id);
                    saw_finished = true;
                }
                _ => {}
            }
        }
        assert!(saw_assembled && saw_finished);
        assert_eq!(
            dl.archive_status(id).await.unwrap().state,
            ArchiveState::Finished
        );
    }

    #[tokio::test]
    async fn progress_events_name_each_unfinished_file() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let dl = downloader(&working, &dest);
        let id = dl.add_nzb_str("demo", MANIFEST).await.unwrap();

        // Half the file is decoded: 5 of the 20 declared bytes read
        let claim = dl.queue.get_for_pool(PoolId(0)).await.unwrap();
        let body = crate::decoder::yenc::encode_for_test("payload.bin", b"hello", 128);
        process_job(
            &dl,
            DecodeJob {
                pool: PoolId(0),
                claim,
                body,
                read_bytes: 5,
                placeholder: false,
            },
        )
        .await;

        let mut events = dl.subscribe();
        let counters = dl.queue.archive_counters(id).await.unwrap();
        emit_file_progress(&dl, id, &counters, 42);

        let event = events.try_recv().unwrap();
        match event {
            Event::SegmentProgress {
                id: got,
                file,
                filename,
                percent,
                archive_percent,
                speed_bps,
            } => {
                assert_eq!(got, id);
                assert_eq!(file, 0);
                assert_eq!(filename, "payload.bin");
                assert_eq!(percent, 25.0);
                assert_eq!(archive_percent, 25.0);
                assert_eq!(speed_bps, 42);
            }
            other => panic!("expected a progress event, got {other:?}"),
        }
        assert!(
            events.try_recv().is_err(),
            "a single-file archive produces one progress event per tick"
        );
    }

    #[tokio::test]
    async fn placeholder_jobs_write_empty_segments_and_emit_missing() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let dl = downloader(&working, &dest);
        let id = dl.add_nzb_str("demo", MANIFEST).await.unwrap();
        let mut events = dl.subscribe();

        let claim = dl.queue.get_for_pool(PoolId(0)).await.unwrap();
        process_job(
            &dl,
            DecodeJob {
                pool: PoolId(0),
                claim,
                body: Vec::new(),
                read_bytes: 0,
                placeholder: true,
            },
        )
        .await;

        let segment = working.path().join("payload.bin.segment0001");
        assert_eq!(std::fs::read(&segment).unwrap(), b"");

        let mut saw_missing = false;
        while let Ok(event) = events.try_recv() {
            if let Event::SegmentMissing { id: got, key, .. } = event {
                assert_eq!(got, id);
                assert_eq!(key.number, 1);
                saw_missing = true;
            }
        }
        assert!(saw_missing);
    }

    #[tokio::test]
    async fn finish_sweeps_segments_of_files_skipped_midway() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let dl = downloader(&working, &dest);

        let manifest = r#"<?xml version="1.0" encoding="UTF-8"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <file poster="p" date="1" subject="demo &quot;payload.bin&quot; (1/1)">
    <groups><group>alt.binaries.test</group></groups>
    <segments>
      <segment bytes="10" number="1">p1@example</segment>
    </segments>
  </file>
  <file poster="p" date="1" subject="demo &quot;extra.vol0+1.par2&quot; (1/2)">
    <groups><group>alt.binaries.test</group></groups>
    <segments>
      <segment bytes="10" number="1">e1@example</segment>
      <segment bytes="10" number="2">e2@example</segment>
    </segments>
  </file>
</nzb>"#;
        let id = dl.add_nzb_str("demo", manifest).await.unwrap();
        let mut events = dl.subscribe();

        let main = dl.queue.get_for_pool(PoolId(0)).await.unwrap();
        assert_eq!(main.key.file, 0);
        let par = dl.queue.get_for_pool(PoolId(0)).await.unwrap();
        assert_eq!(par.key.file, 1);

        // One par segment decodes before the par file is deemed unnecessary
        let body = crate::decoder::yenc::encode_for_test("extra.vol0+1.par2", b"parity", 128);
        process_job(
            &dl,
            DecodeJob {
                pool: PoolId(0),
                claim: par,
                body,
                read_bytes: 6,
                placeholder: false,
            },
        )
        .await;
        let par_segment = working.path().join("extra.vol0+1.par2.segment0001");
        assert!(par_segment.exists());

        dl.queue.skip_par_file(id, 1).await;

        let body = crate::decoder::yenc::encode_for_test("payload.bin", b"main data", 128);
        process_job(
            &dl,
            DecodeJob {
                pool: PoolId(0),
                claim: main,
                body,
                read_bytes: 9,
                placeholder: false,
            },
        )
        .await;

        assert_eq!(
            std::fs::read(dest.path().join("payload.bin")).unwrap(),
            b"main data"
        );
        assert!(
            !par_segment.exists(),
            "finishing must sweep decoded segments of skipped files"
        );

        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::ArchiveFinished { id: got, .. } if got == id) {
                finished = true;
            }
        }
        assert!(finished);
    }

    #[tokio::test]
    async fn low_disk_space_pauses_globally_and_requeues_the_segment() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        // A free-space floor no filesystem can satisfy trips the pre-write probe
        let dl = downloader_with_min_free(&working, &dest, u64::MAX);
        let id = dl.add_nzb_str("demo", MANIFEST).await.unwrap();
        let mut events = dl.subscribe();

        let claim = dl.queue.get_for_pool(PoolId(0)).await.unwrap();
        let key = claim.key;
        let body = crate::decoder::yenc::encode_for_test("payload.bin", b"hello", 128);
        process_job(
            &dl,
            DecodeJob {
                pool: PoolId(0),
                claim,
                body,
                read_bytes: 5,
                placeholder: false,
            },
        )
        .await;

        assert!(*dl.controls.pause_tx.borrow(), "pause gate must be raised");
        let mut saw_disk_full = false;
        while let Ok(event) = events.try_recv() {
            if let Event::DiskFull { id: got, .. } = event {
                assert_eq!(got, id);
                saw_disk_full = true;
            }
        }
        assert!(saw_disk_full);
        assert!(
            !working.path().join("payload.bin.segment0001").exists(),
            "nothing may be written while the disk is full"
        );

        // The segment went back to the queue for a later attempt
        let again = dl.queue.get_for_pool(PoolId(0)).await.unwrap();
        assert_eq!(again.key, key);
    }

    #[tokio::test]
    async fn disk_recovery_probe_releases_only_the_disk_pause() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let dl = downloader_with_min_free(&working, &dest, 1);

        dl.controls
            .disk_paused
            .store(true, std::sync::atomic::Ordering::Relaxed);
        dl.controls.update_pause_gate();
        assert!(*dl.controls.pause_tx.borrow());

        // The temp filesystem has more than one free byte
        probe_disk_recovery(&dl);
        assert!(!*dl.controls.pause_tx.borrow());

        // An operator pause survives disk recovery
        dl.pause_all();
        dl.controls
            .disk_paused
            .store(true, std::sync::atomic::Ordering::Relaxed);
        dl.controls.update_pause_gate();
        probe_disk_recovery(&dl);
        assert!(
            *dl.controls.pause_tx.borrow(),
            "operator pause is independent of the disk gate"
        );
    }

    #[tokio::test]
    async fn decoded_header_renames_provisional_segment_files() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let dl = downloader(&working, &dest);

        // A subject without a quoted filename leaves the file on its temp name
        let manifest = r#"<?xml version="1.0" encoding="UTF-8"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <file poster="p" date="1" subject="no filename here (1/2)">
    <groups><group>alt.binaries.test</group></groups>
    <segments>
      <segment bytes="10" number="1">one@example</segment>
      <segment bytes="10" number="2">two@example</segment>
    </segments>
  </file>
</nzb>"#;
        dl.add_nzb_str("demo", manifest).await.unwrap();

        // First segment arrives as a placeholder, landing under the temp name
        let claim = dl.queue.get_for_pool(PoolId(0)).await.unwrap();
        process_job(
            &dl,
            DecodeJob {
                pool: PoolId(0),
                claim,
                body: Vec::new(),
                read_bytes: 0,
                placeholder: true,
            },
        )
        .await;
        assert!(
            working
                .path()
                .join("hellanzb-tmp-demo.file0001.segment0001")
                .exists()
        );

        // Second segment decodes with a yEnc header naming the real file
        let claim = dl.queue.get_for_pool(PoolId(0)).await.unwrap();
        let body = crate::decoder::yenc::encode_for_test("real.bin", b"tail", 128);
        process_job(
            &dl,
            DecodeJob {
                pool: PoolId(0),
                claim,
                body,
                read_bytes: 4,
                placeholder: false,
            },
        )
        .await;

        assert!(working.path().join("real.bin.segment0001").exists());
        let assembled = dest.path().join("real.bin");
        assert_eq!(std::fs::read(&assembled).unwrap(), b"tail");
    }
}
