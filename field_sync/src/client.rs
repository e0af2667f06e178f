//! The remote contracts the core depends on.
//!
//! Implementations are stateless request/response wrappers. The wire format
//! belongs to the implementation, the shapes here are fixed.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::*;
use crate::error::*;

#[async_trait]
pub trait SubmissionClient: Send + Sync {
    /// Options of `level`, scoped by the code of the selected parent.
    /// `parent_code` is `None` for the top level.
    async fn fetch_options(
        &self,
        level: RegionLevel,
        parent_code: Option<&str>,
        cycle: &str,
    ) -> Result<Vec<RegionOption>, ClientError>;

    /// Success means the server applied the whole batch, keyed by each event's key.
    async fn submit_delta_batch(&self, batch: &DeltaBatch) -> Result<BatchReceipt, ClientError>;

    /// Saves and finalises a record.
    async fn commit_record(&self, request: &CommitRequest) -> Result<CommitReceipt, ClientError>;
}

/// `{ status: "success", data } | { status: "error", message }`
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OptionsResponse {
    Success { data: Vec<RegionOption> },
    Error { message: String },
}

impl OptionsResponse {
    pub fn into_result(self) -> Result<Vec<RegionOption>, ClientError> {
        match self {
            OptionsResponse::Success { data } => Ok(data),
            OptionsResponse::Error { message } => RejectedSnafu {
                status: 200u16,
                message,
            }
            .fail(),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CommitResponse {
    Success {
        #[serde(rename = "recordId")]
        record_id: String,
        #[serde(default)]
        version: Option<u64>,
    },
    Error {
        message: String,
    },
}

impl CommitResponse {
    pub fn into_result(self) -> Result<CommitReceipt, ClientError> {
        match self {
            CommitResponse::Success { record_id, version } => {
                Ok(CommitReceipt { record_id, version })
            }
            CommitResponse::Error { message } => RejectedSnafu {
                status: 200u16,
                message,
            }
            .fail(),
        }
    }
}

/// Bounds a remote call. An elapsed deadline becomes a retryable `Timeout`.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(res) => res,
        Err(_) => TimeoutSnafu { timeout: deadline }.fail(),
    }
}
