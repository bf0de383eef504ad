//! Archive data model: NZB → NzbFile → NzbSegment arena
//!
//! Ownership is strictly top-down: an [`Nzb`] owns its files, a file owns its
//! segments, and everything below the archive refers upward by index via
//! [`SegmentKey`] rather than by pointer. All mutation happens under the
//! segment queue's lock; nothing here is independently thread-safe.

use crate::types::{ArchiveId, SegmentKey};
use std::collections::HashSet;
use std::path::PathBuf;

/// One download job: a parsed NZB manifest plus byte bookkeeping
#[derive(Debug)]
pub struct Nzb {
    /// Unique archive identifier
    pub id: ArchiveId,

    /// Path of the source manifest (informational)
    pub manifest_path: PathBuf,

    /// Human-readable archive name (manifest filename stem)
    pub archive_name: String,

    /// Directory where assembled files land
    pub dest_dir: PathBuf,

    /// Sum of declared segment sizes across all files
    pub total_bytes: u64,

    /// Bytes read off the wire for this archive
    pub read_bytes: u64,

    /// Declared bytes of segments that were dequeued without download
    pub skipped_bytes: u64,

    /// Ordered files as they appeared in the manifest
    pub files: Vec<NzbFile>,
}

impl Nzb {
    /// Whether every file in the archive is fully decoded
    pub fn is_all_files_decoded(&self) -> bool {
        self.files.iter().all(NzbFile::is_all_segments_decoded)
    }
}

/// One named file within an archive
#[derive(Debug)]
pub struct NzbFile {
    /// Raw subject line from the manifest (used for filename discovery)
    pub subject: String,

    /// Ordinal position within the archive, 1-based
    pub number: u32,

    /// Posting date from the manifest, if present
    pub posted_at: Option<chrono::DateTime<chrono::Utc>>,

    /// Resolved filename; None until discovered from the subject line or the
    /// first decoded segment's encoding header
    pub filename: Option<String>,

    /// Newsgroups this file was posted to
    pub groups: Vec<String>,

    /// Sum of declared segment sizes
    pub total_bytes: u64,

    /// Bytes read off the wire for this file's segments
    pub read_bytes: u64,

    /// Whether this is a PAR2 file (main .par2 or recovery volume)
    pub is_par: bool,

    /// Whether this is a PAR2 recovery volume (vol###+##.par2)
    pub is_extra_par: bool,

    /// Whether the queue skipped this par file's segments
    pub is_skipped_par: bool,

    /// Segments sorted by segment number
    pub segments: Vec<NzbSegment>,

    /// Segment numbers not yet decoded
    pub todo_segments: HashSet<u32>,

    /// Segment numbers removed from the queue without download (skipped par blocks)
    pub dequeued_segments: HashSet<u32>,
}

impl NzbFile {
    /// A file is fully decoded iff nothing remains to download and nothing
    /// remains parked in the dequeued set.
    pub fn is_all_segments_decoded(&self) -> bool {
        self.todo_segments.is_empty() && self.dequeued_segments.is_empty()
    }

    /// Deterministic provisional filename used until the real one is known
    pub fn temp_filename(&self, archive_name: &str) -> String {
        format!("hellanzb-tmp-{archive_name}.file{:04}", self.number)
    }

    /// The name segment files are written under right now: the resolved
    /// filename if known, otherwise the provisional temp name.
    pub fn working_name(&self, archive_name: &str) -> String {
        match &self.filename {
            Some(name) => name.clone(),
            None => self.temp_filename(archive_name),
        }
    }

    /// On-disk name of one decoded segment: `<working name>.segment<NNNN>`
    pub fn segment_filename(&self, archive_name: &str, number: u32) -> String {
        format!("{}.segment{number:04}", self.working_name(archive_name))
    }

    /// The lowest present segment number — the "first" segment for filename
    /// discovery even when the manifest lacks a segment 1.
    pub fn first_segment_number(&self) -> Option<u32> {
        self.segments.first().map(|s| s.number)
    }

    /// Find a segment by its number
    pub fn segment(&self, number: u32) -> Option<&NzbSegment> {
        self.segments.iter().find(|s| s.number == number)
    }

    /// Find a segment by its number, mutably
    pub fn segment_mut(&mut self, number: u32) -> Option<&mut NzbSegment> {
        self.segments.iter_mut().find(|s| s.number == number)
    }

    /// Declared bytes of this file's dequeued (skipped) segments
    pub fn skipped_bytes(&self) -> u64 {
        self.dequeued_segments
            .iter()
            .filter_map(|n| self.segment(*n))
            .map(|s| s.bytes)
            .sum()
    }
}

/// One article: one encoded chunk of a file
#[derive(Debug, Clone)]
pub struct NzbSegment {
    /// 1-based segment number; defines assembly order
    pub number: u32,

    /// Declared size in bytes (advisory, used for accounting/progress)
    pub bytes: u64,

    /// Article message-id, without angle brackets
    pub message_id: String,

    /// Queue priority; lower pops first. Assigned at parse time so that
    /// within-file order follows segment number and across-file order follows
    /// manifest position.
    pub priority: u64,

    /// Bitmask of pools that have authoritatively failed this segment
    pub failed_pools: u32,
}

/// Immutable snapshot handed to a connection when it claims a segment.
///
/// Carries everything the fetch needs so the connection never touches the
/// arena (or its lock) mid-download.
#[derive(Debug, Clone)]
pub struct ClaimedSegment {
    /// Which archive the segment belongs to
    pub archive: ArchiveId,

    /// Segment identity within the archive
    pub key: SegmentKey,

    /// Article message-id, without angle brackets
    pub message_id: String,

    /// Candidate newsgroups for the GROUP exchange
    pub groups: Vec<String>,

    /// Declared size in bytes
    pub bytes: u64,

    /// Queue priority the segment was claimed at (used for requeue)
    pub priority: u64,
}
