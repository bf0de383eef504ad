//! Error types for nzb-dl
//!
//! This module provides error handling for the library, including:
//! - Domain-specific error types (Nntp, Decode, Queue, Assemble)
//! - The queue-exhaustion taxonomy (`Empty`, `EmptyForPool`, `PoolsExhausted`)
//!   that drives cross-pool failover
//! - Context information (archive ID, message-id, pool, file path)

use crate::types::{ArchiveId, PoolId, SegmentKey};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for nzb-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nzb-dl
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "servers")
        key: Option<String>,
    },

    /// NNTP protocol or connection error
    #[error("NNTP error: {0}")]
    Nntp(#[from] NntpError),

    /// Article decode error
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Segment queue error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// File assembly error
    #[error("assembly error: {0}")]
    Assemble(#[from] AssembleError),

    /// Invalid NZB manifest
    #[error("invalid NZB: {0}")]
    InvalidNzb(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive not found
    #[error("archive {id} not found")]
    ArchiveNotFound {
        /// The archive ID that was not found
        id: ArchiveId,
    },

    /// Archive already in requested state
    #[error("archive {id} is already {state}")]
    AlreadyInState {
        /// The archive ID that is already in the requested state
        id: ArchiveId,
        /// The current state (e.g., "paused", "canceled")
        state: String,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} archive {id} in state {current_state}")]
    InvalidState {
        /// The archive ID that is in an invalid state for the operation
        id: ArchiveId,
        /// The operation that was attempted (e.g., "pause", "resume", "cancel")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// Shutdown in progress - not accepting new archives
    #[error("shutdown in progress: not accepting new archives")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// NNTP protocol and connection errors
#[derive(Debug, Error)]
pub enum NntpError {
    /// TCP connect failed (refused, DNS failure, unreachable)
    #[error("failed to connect to {host}:{port}: {reason}")]
    ConnectFailed {
        /// Server hostname
        host: String,
        /// Server port
        port: u16,
        /// Underlying failure description
        reason: String,
    },

    /// No data received within the active timeout while a fetch was in flight
    #[error("timed out after {seconds}s waiting for server data")]
    Timeout {
        /// The timeout that elapsed, in seconds
        seconds: u64,
    },

    /// Server rejected the greeting or MODE READER exchange
    #[error("server rejected reader mode: {code} {message}")]
    ModeRejected {
        /// NNTP response code
        code: u16,
        /// Response text
        message: String,
    },

    /// AUTHINFO exchange failed
    #[error("authentication rejected: {code} {message}")]
    AuthRejected {
        /// NNTP response code
        code: u16,
        /// Response text
        message: String,
    },

    /// GROUP selection failed for a specific newsgroup
    #[error("group {group} unavailable: {code}")]
    GroupUnavailable {
        /// The newsgroup that could not be selected
        group: String,
        /// NNTP response code
        code: u16,
    },

    /// Authoritative missing-article response (423 or 430)
    #[error("no such article {message_id}: {code}")]
    ArticleMissing {
        /// The article message-id that the server does not carry
        message_id: String,
        /// NNTP response code (423 or 430)
        code: u16,
    },

    /// Code 400: the server is closing the session (idle timeout)
    #[error("server closed the session (400)")]
    SessionTimeout,

    /// The server replied with something the protocol state did not allow
    #[error("unexpected response to {command}: {code} {message}")]
    UnexpectedResponse {
        /// The command that was sent
        command: String,
        /// NNTP response code
        code: u16,
        /// Response text
        message: String,
    },

    /// The connection was dropped mid-exchange
    #[error("connection closed by server")]
    Disconnected,

    /// Socket-level I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NntpError {
    /// Whether this error is an authoritative "the article/group does not exist"
    /// answer, as opposed to a network fault that a retry might clear.
    pub fn is_authoritative_missing(&self) -> bool {
        matches!(
            self,
            NntpError::ArticleMissing { .. } | NntpError::GroupUnavailable { .. }
        )
    }
}

/// Segment queue errors
///
/// `Empty` and `EmptyForPool` are normal control flow for idle connections;
/// `PoolsExhausted` is the terminal failover outcome for a single segment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Nothing remains in the queue for any pool
    #[error("queue is empty")]
    Empty,

    /// Nothing remains for this pool, but other pools still have retry work
    #[error("no work available for pool {pool}")]
    EmptyForPool {
        /// The pool that found nothing eligible
        pool: PoolId,
    },

    /// Every configured pool has failed this segment
    #[error("segment {key} ({message_id}) has failed on all pools")]
    PoolsExhausted {
        /// Which segment ran out of pools
        key: SegmentKey,
        /// The article message-id, for operator-facing logs
        message_id: String,
    },

    /// More server pools configured than the failed-pool mask can represent
    #[error("too many server pools: {count} (maximum 32)")]
    TooManyPools {
        /// Number of configured pools
        count: usize,
    },
}

/// Article decode errors
///
/// Decode failures are deliberately non-fatal in the pipeline (an undecodable
/// article degrades to a zero-byte placeholder); these variants exist for
/// logging and for unit-level assertions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// A yEnc or UUencode header line could not be parsed
    #[error("malformed header line: {line}")]
    MalformedHeader {
        /// The offending line (lossily decoded for display)
        line: String,
    },

    /// No recognizable encoding header was found
    #[error("no recognizable encoding header")]
    UnknownEncoding,
}

/// File assembly errors
#[derive(Debug, Error)]
pub enum AssembleError {
    /// Assembly was aborted because the archive was canceled
    #[error("assembly canceled")]
    Canceled,

    /// A decoded segment file vanished between decode and assembly
    #[error("segment file missing: {path}")]
    SegmentFileMissing {
        /// The expected on-disk segment path
        path: PathBuf,
    },

    /// No unique destination name could be found
    #[error("could not find unique name for {path}")]
    CollisionUnresolved {
        /// The colliding destination path
        path: PathBuf,
    },

    /// I/O failure while concatenating
    #[error("I/O error during assembly: {0}")]
    Io(#[from] std::io::Error),
}
