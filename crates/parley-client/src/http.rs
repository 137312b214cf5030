use bytes::Bytes;
use reqwest::Client;

use parley_types::api::{
    ApiError, ClientLogEntry, UploadCompleteRequest, UploadCompleteResponse, UploadInitRequest,
    UploadInitResponse,
};

use crate::scheduler::{ChunkSink, TransferError};

/// HTTP client for the upload API.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST /api/upload/init — open an upload session.
    pub async fn upload_init(
        &self,
        req: &UploadInitRequest,
    ) -> Result<UploadInitResponse, TransferError> {
        let resp = self
            .http
            .post(format!("{}/api/upload/init", self.base_url))
            .json(req)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(TransferError::Init(error_body(resp).await));
        }
        Ok(resp.json().await?)
    }

    /// POST /api/upload/complete — request server-side reassembly.
    pub async fn upload_complete(
        &self,
        upload_id: &str,
        total_chunks: usize,
    ) -> Result<UploadCompleteResponse, TransferError> {
        let resp = self
            .http
            .post(format!("{}/api/upload/complete", self.base_url))
            .json(&UploadCompleteRequest {
                upload_id: upload_id.to_string(),
                total_chunks,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(TransferError::Complete(error_body(resp).await));
        }
        Ok(resp.json().await?)
    }

    /// POST /api/client-log — ship one diagnostic entry. Best-effort; the
    /// caller decides whether to swallow the error.
    pub async fn send_log(&self, entry: &ClientLogEntry) -> Result<(), reqwest::Error> {
        self.http
            .post(format!("{}/api/client-log", self.base_url))
            .json(entry)
            .send()
            .await?;
        Ok(())
    }
}

impl ChunkSink for ApiClient {
    /// POST /api/upload/chunk — one chunk as a multipart form.
    async fn send_chunk(
        &self,
        upload_id: &str,
        index: usize,
        total_chunks: usize,
        data: Bytes,
    ) -> Result<(), TransferError> {
        let form = reqwest::multipart::Form::new()
            .text("upload_id", upload_id.to_string())
            .text("index", index.to_string())
            .text("total_chunks", total_chunks.to_string())
            .part(
                "chunk",
                reqwest::multipart::Part::stream(data).file_name("blob"),
            );

        let resp = self
            .http
            .post(format!("{}/api/upload/chunk", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransferError::Chunk {
                index,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(TransferError::Chunk {
                index,
                reason: error_body(resp).await,
            });
        }
        Ok(())
    }
}

/// Extract the server's error message from a failed response, falling back
/// to the HTTP status line.
async fn error_body(resp: reqwest::Response) -> String {
    let status = resp.status();
    match resp.json::<ApiError>().await {
        Ok(body) => body.error,
        Err(_) => format!("HTTP {}", status),
    }
}
