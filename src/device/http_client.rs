use log::debug;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use field_sync::client::{CommitResponse, OptionsResponse};
use field_sync::*;

/// JSON over HTTP implementation of the remote contracts.
pub struct HttpSubmissionClient {
    client: reqwest::Client,
    api_url: String,
}

#[derive(Deserialize, Debug, Default)]
struct ErrorBody {
    message: Option<String>,
    #[serde(rename = "serverVersion")]
    server_version: Option<u64>,
}

impl HttpSubmissionClient {
    /// Deadlines are applied by the callers, the client itself never times out.
    pub fn new(api_url: &str) -> HttpSubmissionClient {
        HttpSubmissionClient {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.api_url, path)
    }
}

fn transport_error(e: reqwest::Error) -> ClientError {
    if e.is_decode() {
        ClientError::MalformedResponse {
            message: e.to_string(),
        }
    } else {
        ClientError::Unreachable {
            message: e.to_string(),
        }
    }
}

fn status_error(status: StatusCode, body: &str) -> ClientError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    if status.is_server_error() {
        return ClientError::ServerUnavailable {
            status: status.as_u16(),
        };
    }
    if status == StatusCode::CONFLICT {
        if let Some(server_version) = parsed.server_version {
            return ClientError::VersionConflict { server_version };
        }
    }
    ClientError::Rejected {
        status: status.as_u16(),
        message: parsed.message.unwrap_or_else(|| {
            let reason = status.canonical_reason().unwrap_or("request refused");
            format!("{} (HTTP {})", reason, status.as_u16())
        }),
    }
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        debug!("HTTP {}: {}", status, body);
        return Err(status_error(status, &body));
    }
    resp.json::<T>().await.map_err(transport_error)
}

#[async_trait]
impl SubmissionClient for HttpSubmissionClient {
    async fn fetch_options(
        &self,
        level: RegionLevel,
        parent_code: Option<&str>,
        cycle: &str,
    ) -> Result<Vec<RegionOption>, ClientError> {
        let mut query: Vec<(&str, &str)> = vec![("cycle", cycle)];
        if let Some(parent) = parent_code {
            query.push(("parent", parent));
        }
        let resp = self
            .client
            .get(self.url(&format!("regions/{}", level)))
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;
        read_json::<OptionsResponse>(resp).await?.into_result()
    }

    async fn submit_delta_batch(&self, batch: &DeltaBatch) -> Result<BatchReceipt, ClientError> {
        let resp = self
            .client
            .post(self.url("checkins/batch"))
            .json(batch)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(resp).await
    }

    async fn commit_record(&self, request: &CommitRequest) -> Result<CommitReceipt, ClientError> {
        let resp = self
            .client
            .post(self.url("records"))
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;
        read_json::<CommitResponse>(resp).await?.into_result()
    }
}
