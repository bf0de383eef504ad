//! Core types for nzb-dl

use serde::{Deserialize, Serialize};

/// Unique identifier for an archive (one NZB download job)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveId(pub u64);

impl ArchiveId {
    /// Create a new ArchiveId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ArchiveId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ArchiveId> for u64 {
    fn from(id: ArchiveId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ArchiveId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Index of a server pool within the configured server list.
///
/// Used as a bit position in per-segment failed-pool masks, which caps the
/// number of pools at 32.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(pub usize);

impl PoolId {
    /// Bit for this pool in a failed-pools mask
    pub fn bit(&self) -> u32 {
        1 << self.0
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one segment within an archive: file index plus 1-based segment number
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentKey {
    /// Index of the file within the archive's file list
    pub file: usize,
    /// 1-based segment number (defines assembly order)
    pub number: u32,
}

impl std::fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file {} segment {}", self.file, self.number)
    }
}

/// Archive lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveState {
    /// Parsed and queued, no connection has started on it yet
    Idle,
    /// Connections are actively fetching segments
    Downloading,
    /// Paused by the operator or by a disk-full condition
    Paused,
    /// All files assembled
    Finished,
    /// Canceled by the operator or fatally failed
    Canceled,
}

impl ArchiveState {
    /// Whether the archive can make no further progress
    pub fn is_terminal(&self) -> bool {
        matches!(self, ArchiveState::Finished | ArchiveState::Canceled)
    }
}

impl std::fmt::Display for ArchiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArchiveState::Idle => "idle",
            ArchiveState::Downloading => "downloading",
            ArchiveState::Paused => "paused",
            ArchiveState::Finished => "finished",
            ArchiveState::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// Event emitted during the download lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Archive parsed and added to the queue
    ArchiveQueued {
        /// Archive ID
        id: ArchiveId,
        /// Archive name
        name: String,
        /// Total declared bytes across all segments
        total_bytes: u64,
    },

    /// Download progress update for one file of an archive
    SegmentProgress {
        /// Archive ID
        id: ArchiveId,
        /// File index within the archive
        file: usize,
        /// The name segment files are currently written under
        filename: String,
        /// File progress percentage (0.0 to 100.0)
        percent: f32,
        /// Archive-level progress percentage (0.0 to 100.0)
        archive_percent: f32,
        /// Current aggregate read speed in bytes per second
        speed_bps: u64,
    },

    /// A file's segments were all decoded and the file was assembled
    FileAssembled {
        /// Archive ID
        id: ArchiveId,
        /// Resolved filename
        filename: String,
        /// Final on-disk path
        path: std::path::PathBuf,
    },

    /// A segment is permanently unobtainable; a zero-byte placeholder was written
    SegmentMissing {
        /// Archive ID
        id: ArchiveId,
        /// Which segment
        key: SegmentKey,
        /// Article message-id
        message_id: String,
    },

    /// Archive paused
    ArchivePaused {
        /// Archive ID
        id: ArchiveId,
    },

    /// Archive resumed
    ArchiveResumed {
        /// Archive ID
        id: ArchiveId,
    },

    /// Archive canceled
    ArchiveCanceled {
        /// Archive ID
        id: ArchiveId,
    },

    /// All files of the archive are assembled; ready for post-processing hand-off
    ArchiveFinished {
        /// Archive ID
        id: ArchiveId,
        /// Archive name
        name: String,
        /// Destination directory holding the assembled files
        dest_dir: std::path::PathBuf,
    },

    /// Archive fatally failed (e.g. a segment had no viable group on any pool)
    ArchiveFailed {
        /// Archive ID
        id: ArchiveId,
        /// Error message
        error: String,
    },

    /// Disk filled up during a segment or assembly write; downloading paused globally
    DiskFull {
        /// Archive that was being written when the condition hit
        id: ArchiveId,
        /// Path whose filesystem is full
        path: std::path::PathBuf,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

/// Snapshot of one archive's progress, returned by `status()`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveStatus {
    /// Archive ID
    pub id: ArchiveId,

    /// Archive name
    pub name: String,

    /// Current state
    pub state: ArchiveState,

    /// Total declared bytes
    pub total_bytes: u64,

    /// Bytes read off the wire so far
    pub read_bytes: u64,

    /// Bytes belonging to skipped (dequeued) segments
    pub skipped_bytes: u64,

    /// Progress percentage (0.0 to 100.0)
    pub percent: f32,

    /// Per-file progress. Empty for terminal archives, whose per-file
    /// bookkeeping has been released.
    pub files: Vec<FileStatus>,
}

/// Progress of one file within an archive
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileStatus {
    /// File index within the archive
    pub file: usize,

    /// The name segment files are currently written under
    pub filename: String,

    /// Sum of the file's declared segment sizes
    pub total_bytes: u64,

    /// Bytes read off the wire for this file
    pub read_bytes: u64,

    /// Declared bytes of the file's skipped (dequeued) segments
    pub skipped_bytes: u64,

    /// File progress percentage (0.0 to 100.0)
    pub percent: f32,
}

/// Snapshot of one connection pool, returned by `status()`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Server profile name
    pub name: String,

    /// Connections currently fetching a segment
    pub active_connections: usize,

    /// Connections with an established, authenticated session
    pub connected: usize,
}

/// Aggregate status summary
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Per-archive progress
    pub archives: Vec<ArchiveStatus>,

    /// Per-pool connection statistics
    pub pools: Vec<PoolStatus>,

    /// Aggregate read speed across all connections (bytes per second)
    pub speed_bps: u64,

    /// Bytes still represented in the segment queue
    pub queued_bytes: u64,

    /// Whether downloading is globally paused
    pub paused: bool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn archive_id_from_u64_and_back() {
        let id = ArchiveId::from(42_u64);
        let raw: u64 = id.into();
        assert_eq!(raw, 42, "round-trip through From/Into must preserve value");
    }

    #[test]
    fn archive_id_from_str_parses_valid_integer() {
        let id = ArchiveId::from_str("123").unwrap();
        assert_eq!(id.get(), 123);
    }

    #[test]
    fn archive_id_from_str_rejects_non_numeric() {
        assert!(ArchiveId::from_str("abc").is_err());
        assert!(ArchiveId::from_str("").is_err());
        assert!(
            ArchiveId::from_str("-1").is_err(),
            "ArchiveId wraps u64 and must reject negatives"
        );
    }

    #[test]
    fn archive_id_display_matches_inner_value() {
        assert_eq!(ArchiveId::new(999).to_string(), "999");
    }

    #[test]
    fn pool_id_bit_positions() {
        assert_eq!(PoolId(0).bit(), 0b0001);
        assert_eq!(PoolId(1).bit(), 0b0010);
        assert_eq!(PoolId(3).bit(), 0b1000);
        assert_eq!(
            PoolId(31).bit(),
            1 << 31,
            "pool 31 is the highest representable pool"
        );
    }

    #[test]
    fn archive_state_terminal_classification() {
        assert!(ArchiveState::Finished.is_terminal());
        assert!(ArchiveState::Canceled.is_terminal());
        assert!(!ArchiveState::Idle.is_terminal());
        assert!(!ArchiveState::Downloading.is_terminal());
        assert!(!ArchiveState::Paused.is_terminal());
    }

    #[test]
    fn archive_state_display_is_lowercase() {
        assert_eq!(ArchiveState::Downloading.to_string(), "downloading");
        assert_eq!(ArchiveState::Paused.to_string(), "paused");
    }

    #[test]
    fn event_serializes_with_snake_case_tag() {
        let event = Event::ArchivePaused {
            id: ArchiveId::new(7),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(
            json.contains(r#""type":"archive_paused""#),
            "tagged serde representation should use snake_case type names, got: {json}"
        );
    }

    #[test]
    fn segment_key_display_names_file_and_number() {
        let key = SegmentKey { file: 2, number: 14 };
        assert_eq!(key.to_string(), "file 2 segment 14");
    }
}
