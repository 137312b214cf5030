use serde::{Deserialize, Serialize};

use crate::models::FileMeta;

// -- Upload --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadInitRequest {
    pub filename: String,
    pub size: u64,
    pub mime: String,
    pub client_msg_id: String,
    /// Display name of the uploader, for attributing the completion
    /// broadcast. Optional; omitted by clients that have not registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadInitResponse {
    pub ok: bool,
    pub upload_id: String,
    /// Server-dictated chunk size in bytes.
    pub chunk_size: u64,
    /// Server-dictated cap on concurrent chunk transmissions.
    pub max_concurrency: usize,
    pub max_file_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadCompleteRequest {
    pub upload_id: String,
    /// Locally counted chunk total; the server checks it against what it
    /// actually received before assembling.
    pub total_chunks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadCompleteResponse {
    pub ok: bool,
    pub file: FileMeta,
}

/// Error body shared by all JSON endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub ok: bool,
    pub error: String,
}

impl ApiError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
        }
    }
}

// -- Diagnostics --

/// One client-side log line, shipped best-effort to `/api/client-log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientLogEntry {
    pub level: String,
    pub args: Vec<String>,
    pub page: String,
}
