use std::time::Duration;

use snafu::Snafu;

use crate::config::RegionLevel;

/// How a failure should be treated by the caller.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum ErrorKind {
    /// Timeout, offline, 5xx. Always retryable, local state is kept.
    TransientNetwork,
    /// Caught locally, never sent to the server.
    Validation,
    /// The server refused the request. The message is shown verbatim.
    ServerRejected,
    /// The record moved on the server since the draft was opened.
    Conflict,
    Storage,
}

/// Failures of the remote contracts.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
    #[snafu(display("request timed out after {}s", timeout.as_secs_f32()))]
    Timeout { timeout: Duration },

    #[snafu(display("server unreachable: {message}"))]
    Unreachable { message: String },

    #[snafu(display("server unavailable (HTTP {status})"))]
    ServerUnavailable { status: u16 },

    #[snafu(display("{message}"))]
    Rejected { status: u16, message: String },

    #[snafu(display("record was changed on the server (now at version {server_version})"))]
    VersionConflict { server_version: u64 },

    #[snafu(display("unexpected response from server: {message}"))]
    MalformedResponse { message: String },
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Timeout { .. }
            | ClientError::Unreachable { .. }
            | ClientError::ServerUnavailable { .. }
            | ClientError::MalformedResponse { .. } => ErrorKind::TransientNetwork,
            ClientError::Rejected { .. } => ErrorKind::ServerRejected,
            ClientError::VersionConflict { .. } => ErrorKind::Conflict,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("local storage failed for {key}"))]
    StorageIo { source: std::io::Error, key: String },

    #[snafu(display("local record {key} could not be encoded or decoded"))]
    StorageFormat {
        source: serde_json::Error,
        key: String,
    },

    #[snafu(display("{field}: {message}"))]
    InvalidField { field: String, message: String },

    #[snafu(display("cannot select a {level} before a {parent} is selected"))]
    MissingAncestor {
        level: RegionLevel,
        parent: RegionLevel,
    },

    #[snafu(display("nothing to submit: no candidate has any votes"))]
    EmptySubmission {},

    #[snafu(display("station {station_id} would exceed its cap of {cap} check-ins"))]
    CapacityExceeded { station_id: String, cap: u64 },

    #[snafu(display("{source}"))]
    Remote { source: ClientError },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::StorageIo { .. } | SyncError::StorageFormat { .. } => ErrorKind::Storage,
            SyncError::InvalidField { .. }
            | SyncError::MissingAncestor { .. }
            | SyncError::EmptySubmission {}
            | SyncError::CapacityExceeded { .. } => ErrorKind::Validation,
            SyncError::Remote { source } => source.kind(),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
