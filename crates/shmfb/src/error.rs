//! Error taxonomy for segment lifecycle, layout validation and host enumeration.

use std::io;

use common::types::Topology;

pub type Result<T> = std::result::Result<T, ShmError>;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("shared memory request too large: {requested} bytes > max {max} bytes (consider raising shmmax)")]
    AllocationTooLarge { requested: usize, max: usize },

    #[error("topology {topology} needs {required} bytes > max {max} bytes")]
    TopologyTooLarge {
        topology: Topology,
        required: usize,
        max: usize,
    },

    #[error("shmget failed (size:{size}): {source}")]
    AllocationFailed {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed (shmId:{shm_id}): {source}")]
    AttachFailed {
        op: &'static str,
        shm_id: i32,
        #[source]
        source: io::Error,
    },

    #[error("shared memory size mismatch (shmId:{shm_id}): {what} expected:{expected} actual:{actual}")]
    SizeMismatch {
        shm_id: i32,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{layout} layout mismatch: requires {expected} bytes, segment has {actual} bytes")]
    LayoutMismatch {
        layout: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid chanMode byte {value} (shmId:{shm_id})")]
    InvalidChanMode { shm_id: i32, value: u8 },

    #[error("shmdt failed (shmId:{shm_id}): {source}")]
    DetachFailed {
        shm_id: i32,
        #[source]
        source: io::Error,
    },

    #[error("shmctl(IPC_RMID) failed (shmId:{shm_id}): {source}")]
    RemoveFailed {
        shm_id: i32,
        #[source]
        source: io::Error,
    },

    #[error("segment listing tool unavailable: {tool}: {source}")]
    ToolUnavailable {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("could not parse segment listing line {line:?}: {reason}")]
    ParseFailed { line: String, reason: String },

    #[error("pixel payload too small for {topology}: expected {expected} bytes, got {actual}")]
    PayloadSize {
        topology: Topology,
        expected: usize,
        actual: usize,
    },
}

impl ShmError {
    /// Segment id the failure relates to, if any.
    pub fn shm_id(&self) -> Option<i32> {
        match self {
            ShmError::AttachFailed { shm_id, .. }
            | ShmError::SizeMismatch { shm_id, .. }
            | ShmError::InvalidChanMode { shm_id, .. }
            | ShmError::DetachFailed { shm_id, .. }
            | ShmError::RemoveFailed { shm_id, .. } => Some(*shm_id),
            _ => None,
        }
    }

    /// OS errno carried by the failure, if any.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            ShmError::AllocationFailed { source, .. }
            | ShmError::AttachFailed { source, .. }
            | ShmError::DetachFailed { source, .. }
            | ShmError::RemoveFailed { source, .. }
            | ShmError::ToolUnavailable { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
