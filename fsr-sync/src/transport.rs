//! Transport between the device and the server
//!
//! Errors come back in the shared taxonomy. Anything the client should
//! simply try again later (connection failures, timeouts, 5xx, version
//! conflicts) arrives as `TransientUpload`; a malformed payload arrives
//! as `Validation` and is never retried.

use async_trait::async_trait;
use fsr_common::api::{
    ErrorBody, SubmitInterviewRequest, SubmitInterviewResponse, SyncStalledRequest,
    UploadAudioParams, UploadAudioResponse, VerifyAudioResponse, ACTOR_HEADER,
};
use fsr_common::{Error, Result};
use std::time::Duration;

const USER_AGENT: &str = concat!("fsr-sync/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT_SECS: u64 = 60;

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Phase 1
    async fn submit_interview(&self, req: &SubmitInterviewRequest)
        -> Result<SubmitInterviewResponse>;

    /// Phase 2, keyed by the id phase 1 returned
    async fn upload_audio(
        &self,
        response_id: &str,
        params: &UploadAudioParams,
        bytes: Vec<u8>,
    ) -> Result<UploadAudioResponse>;

    /// Read-back of the stored evidence
    async fn verify_audio(&self, response_id: &str) -> Result<VerifyAudioResponse>;

    /// Surface an entry the client has given up on
    async fn report_sync_stalled(&self, response_id: &str, detail: &str) -> Result<()>;
}

/// HTTP transport against fsr-core
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: String,
    actor_id: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, actor_id: &str) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            actor_id: actor_id.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
        response_id: Option<&str>,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| Error::TransientUpload(format!("Unreadable server response: {}", e)));
        }

        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => (parsed.error.code, parsed.error.message),
            Err(_) => (String::new(), body),
        };
        Err(map_error(status.as_u16(), &code, message, response_id))
    }
}

/// Translate an HTTP failure back into the shared taxonomy
pub fn map_error(status: u16, code: &str, message: String, response_id: Option<&str>) -> Error {
    match code {
        "VALIDATION_ERROR" => Error::Validation(message),
        "NOT_FOUND" => Error::NotFound(message),
        "EVIDENCE_MISSING" => Error::EvidenceMissing {
            response_id: response_id.unwrap_or_default().to_string(),
        },
        "TRANSIENT_UPLOAD_FAILURE" | "CONCURRENT_MODIFICATION" => Error::TransientUpload(message),
        "UNAUTHORIZED" => Error::Config(format!("Server refused actor identity: {}", message)),
        _ if status >= 500 => Error::TransientUpload(format!("HTTP {}: {}", status, message)),
        _ if status == 400 || status == 413 || status == 422 => Error::Validation(message),
        _ => Error::Internal(format!("HTTP {}: {}", status, message)),
    }
}

fn network_error(e: reqwest::Error) -> Error {
    Error::TransientUpload(format!("Network error: {}", e))
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn submit_interview(
        &self,
        req: &SubmitInterviewRequest,
    ) -> Result<SubmitInterviewResponse> {
        let response = self
            .http_client
            .post(self.url("/api/responses"))
            .header(ACTOR_HEADER, &self.actor_id)
            .json(req)
            .send()
            .await
            .map_err(network_error)?;
        self.decode(response, None).await
    }

    async fn upload_audio(
        &self,
        response_id: &str,
        params: &UploadAudioParams,
        bytes: Vec<u8>,
    ) -> Result<UploadAudioResponse> {
        let response = self
            .http_client
            .post(self.url(&format!("/api/responses/{}/audio", response_id)))
            .header(ACTOR_HEADER, &self.actor_id)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .query(params)
            .body(bytes)
            .send()
            .await
            .map_err(network_error)?;
        self.decode(response, Some(response_id)).await
    }

    async fn verify_audio(&self, response_id: &str) -> Result<VerifyAudioResponse> {
        let response = self
            .http_client
            .get(self.url(&format!("/api/responses/{}/audio/verify", response_id)))
            .header(ACTOR_HEADER, &self.actor_id)
            .send()
            .await
            .map_err(network_error)?;
        self.decode(response, Some(response_id)).await
    }

    async fn report_sync_stalled(&self, response_id: &str, detail: &str) -> Result<()> {
        let response = self
            .http_client
            .post(self.url(&format!("/api/responses/{}/sync-stalled", response_id)))
            .header(ACTOR_HEADER, &self.actor_id)
            .json(&SyncStalledRequest {
                detail: detail.to_string(),
            })
            .send()
            .await
            .map_err(network_error)?;
        self.decode::<serde_json::Value>(response, Some(response_id))
            .await
            .map(|_| ())
    }
}
