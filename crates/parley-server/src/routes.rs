use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, Multipart, Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

use parley_gateway::Room;
use parley_gateway::room::UploadSession;
use parley_types::api::{
    ApiError, UploadCompleteRequest, UploadCompleteResponse, UploadInitRequest,
    UploadInitResponse,
};
use parley_types::models::FileMeta;

use crate::config::UploadConfig;
use crate::storage::{Storage, stored_name};

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub room: Room,
    pub storage: Arc<Storage>,
    pub config: Arc<UploadConfig>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn api_err<T>(status: StatusCode, msg: impl Into<String>) -> ApiResult<T> {
    Err((status, Json(ApiError::new(msg))))
}

// -- Upload protocol --

/// POST /api/upload/init — open an upload session and hand the client its
/// transfer parameters.
pub async fn upload_init(
    State(state): State<AppState>,
    Json(req): Json<UploadInitRequest>,
) -> ApiResult<UploadInitResponse> {
    let filename = req.filename.trim();
    if filename.is_empty() || req.size == 0 {
        return api_err(StatusCode::BAD_REQUEST, "file metadata incomplete");
    }
    if req.size > state.config.max_file_size_bytes() {
        return api_err(StatusCode::PAYLOAD_TOO_LARGE, "file exceeds size limit");
    }

    let upload_id = Uuid::new_v4().to_string();
    state
        .storage
        .create_session_dir(&upload_id)
        .await
        .map_err(|e| {
            warn!("failed to create chunk dir for {}: {}", upload_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new("storage unavailable")),
            )
        })?;

    state
        .room
        .create_upload_session(
            upload_id.clone(),
            UploadSession {
                filename: filename.to_string(),
                size: req.size,
                mime: req.mime.trim().to_string(),
                client_msg_id: Some(req.client_msg_id.trim().to_string())
                    .filter(|id| !id.is_empty()),
                username: req.username,
            },
        )
        .await;

    info!(
        "upload {} opened: {} ({} bytes)",
        upload_id, filename, req.size
    );

    Ok(Json(UploadInitResponse {
        ok: true,
        upload_id,
        chunk_size: state.config.chunk_size_bytes(),
        max_concurrency: state.config.max_concurrency,
        max_file_size: state.config.max_file_size_bytes(),
    }))
}

/// POST /api/upload/chunk — multipart form `{upload_id, index,
/// total_chunks, chunk}`. Accepts chunks in any order.
pub async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let mut upload_id: Option<String> = None;
    let mut index: Option<String> = None;
    let mut total_chunks: Option<String> = None;
    let mut chunk: Option<bytes::Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(format!("bad multipart field: {}", e))),
        )
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "upload_id" => upload_id = field.text().await.ok(),
            "index" => index = field.text().await.ok(),
            "total_chunks" => total_chunks = field.text().await.ok(),
            "chunk" => chunk = field.bytes().await.ok(),
            other => {
                warn!("ignoring unknown multipart field {:?}", other);
            }
        }
    }

    let upload_id = upload_id.unwrap_or_default();
    if upload_id.is_empty() || !state.room.has_upload_session(&upload_id).await {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::new("upload session not found")),
        ));
    }

    let (Some(index), Some(total_chunks), Some(chunk)) = (index, total_chunks, chunk) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new("chunk metadata incomplete")),
        ));
    };

    let (Ok(index), Ok(total_chunks)) =
        (index.parse::<usize>(), total_chunks.parse::<usize>())
    else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new("chunk index malformed")),
        ));
    };

    if total_chunks == 0 || index >= total_chunks {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new("chunk index out of range")),
        ));
    }

    state
        .storage
        .write_chunk(&upload_id, index, &chunk)
        .await
        .map_err(|e| {
            warn!("failed to write chunk {} of {}: {}", index, upload_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new("failed to persist chunk")),
            )
        })?;

    Ok(StatusCode::OK)
}

/// POST /api/upload/complete — verify every chunk arrived, assemble the
/// final file, and broadcast the file message. Consumes the session:
/// a second call for the same id gets 404.
pub async fn upload_complete(
    State(state): State<AppState>,
    Json(req): Json<UploadCompleteRequest>,
) -> ApiResult<UploadCompleteResponse> {
    if req.total_chunks == 0 {
        return api_err(StatusCode::BAD_REQUEST, "chunk count malformed");
    }

    let Some(session) = state.room.take_upload_session(&req.upload_id).await else {
        return api_err(StatusCode::NOT_FOUND, "upload session not found");
    };

    let (stored, size) = match state
        .storage
        .assemble(&req.upload_id, &session.filename, req.total_chunks)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            warn!("assembly failed for {}: {}", req.upload_id, e);
            state.storage.discard_session(&req.upload_id).await;
            return api_err(StatusCode::BAD_REQUEST, e.to_string());
        }
    };
    debug_assert_eq!(stored, stored_name(&req.upload_id, &session.filename));

    let meta = FileMeta {
        file_id: req.upload_id.clone(),
        original_name: session.filename.clone(),
        mime: session.mime.clone(),
        size,
        url: format!("/media/{}", req.upload_id),
    };

    let msg = state.room.post_file(session, meta.clone()).await;
    info!(
        "upload {} finalized as message {} ({} bytes)",
        req.upload_id, msg.msg_id, size
    );

    Ok(Json(UploadCompleteResponse { ok: true, file: meta }))
}

// -- Media --

#[derive(Debug, Deserialize)]
pub struct MediaQuery {
    #[serde(default)]
    pub download: Option<String>,
}

/// GET /media/{file_id} — serve an assembled upload. `?download=1` forces
/// attachment disposition instead of inline preview.
pub async fn serve_media(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
    Query(query): Query<MediaQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let Some(meta) = state.room.lookup_file(&file_id).await else {
        return Err(StatusCode::NOT_FOUND);
    };

    let path = state
        .storage
        .stored_path(&stored_name(&file_id, &meta.original_name));
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let len = file
        .metadata()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .len();

    let mut headers = HeaderMap::new();
    let mime = if meta.mime.is_empty() {
        "application/octet-stream"
    } else {
        meta.mime.as_str()
    };
    headers.insert(
        header::CONTENT_TYPE,
        mime.parse()
            .unwrap_or(header::HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        len.to_string()
            .parse()
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
    );
    if query.download.as_deref() == Some("1") {
        let disposition = format!(
            "attachment; filename=\"{}\"",
            meta.original_name.replace(['"', '\\'], "_")
        );
        if let Ok(value) = disposition.parse() {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((StatusCode::OK, headers, body))
}

// -- Diagnostics --

/// POST /api/client-log — best-effort sink for client-side logs. Always
/// 204: a broken sink must never become a client-visible error.
pub async fn client_log(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> StatusCode {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let entry = client_log_entry(addr, user_agent, &payload);

    if let Err(e) = append_client_log(&entry).await {
        warn!("client log append failed: {}", e);
    }
    StatusCode::NO_CONTENT
}

/// One log line, stamped with server time and the caller's address and
/// user agent.
fn client_log_entry(
    addr: SocketAddr,
    user_agent: &str,
    payload: &serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "server_ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "remote_addr": addr.ip().to_string(),
        "ua": user_agent,
        "level": payload.get("level").and_then(|v| v.as_str()).unwrap_or("info"),
        "args": payload.get("args").cloned().unwrap_or_else(|| serde_json::json!([])),
        "page": payload.get("page").and_then(|v| v.as_str()).unwrap_or(""),
    })
}

async fn append_client_log(entry: &serde_json::Value) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;
    tokio::fs::create_dir_all("logs").await?;
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open("logs/client.log")
        .await?;
    file.write_all(format!("{}\n", entry).as_bytes()).await?;
    Ok(())
}

// -- Gateway --

/// GET /ws — upgrade to the chat gateway.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| parley_gateway::connection::handle_connection(socket, state.room))
}

/// GET /health — liveness check.
pub async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_log_entry_carries_caller_context() {
        let addr: SocketAddr = "192.168.1.7:52011".parse().unwrap();
        let payload = serde_json::json!({
            "level": "error",
            "args": ["upload failed", "chunk 2"],
            "page": "/chat",
        });
        let entry = client_log_entry(addr, "Mozilla/5.0 (X11; Linux)", &payload);

        assert_eq!(entry["remote_addr"], "192.168.1.7");
        assert_eq!(entry["ua"], "Mozilla/5.0 (X11; Linux)");
        assert_eq!(entry["level"], "error");
        assert_eq!(entry["args"][1], "chunk 2");
        assert_eq!(entry["page"], "/chat");
        assert!(entry["server_ts"].as_str().is_some());
    }

    #[test]
    fn client_log_entry_tolerates_sparse_payload() {
        let addr: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        let entry = client_log_entry(addr, "", &serde_json::json!({}));
        assert_eq!(entry["level"], "info");
        assert_eq!(entry["args"], serde_json::json!([]));
        assert_eq!(entry["page"], "");
        assert_eq!(entry["ua"], "");
    }
}
