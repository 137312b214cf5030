use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use parley_types::api::{UploadCompleteResponse, UploadInitRequest, UploadInitResponse};
use parley_types::models::FileMeta;

use crate::http::ApiClient;
use crate::scheduler::{run_transfer, ChunkPlan, ChunkSink, TransferError, TransferProgress};
use crate::session::SessionUpdate;
use crate::timeline::Timeline;

/// The upload endpoints an upload run talks to. Production is the HTTP
/// API; tests swap in an in-memory endpoint.
pub trait UploadApi: ChunkSink {
    fn init(
        &self,
        req: &UploadInitRequest,
    ) -> impl Future<Output = Result<UploadInitResponse, TransferError>> + Send;

    fn complete(
        &self,
        upload_id: &str,
        total_chunks: usize,
    ) -> impl Future<Output = Result<UploadCompleteResponse, TransferError>> + Send;
}

impl UploadApi for ApiClient {
    async fn init(&self, req: &UploadInitRequest) -> Result<UploadInitResponse, TransferError> {
        self.upload_init(req).await
    }

    async fn complete(
        &self,
        upload_id: &str,
        total_chunks: usize,
    ) -> Result<UploadCompleteResponse, TransferError> {
        self.upload_complete(upload_id, total_chunks).await
    }
}

/// Drives one file upload end to end: placeholder, init, chunk transfer,
/// finalize. The confirming message arrives over the gateway broadcast and
/// replaces the placeholder there; the uploader never appends the final
/// message itself.
pub struct UploadManager<A> {
    api: Arc<A>,
    timeline: Arc<Mutex<Timeline>>,
    updates_tx: mpsc::UnboundedSender<SessionUpdate>,
}

impl<A: UploadApi + Send + Sync + 'static> UploadManager<A> {
    pub fn new(
        api: Arc<A>,
        timeline: Arc<Mutex<Timeline>>,
        updates_tx: mpsc::UnboundedSender<SessionUpdate>,
    ) -> Self {
        Self {
            api,
            timeline,
            updates_tx,
        }
    }

    /// Upload `data` as one file message.
    ///
    /// Any failure flags the placeholder and aborts the run right there:
    /// a failed init sends no chunks, a failed chunk skips the finalize.
    /// The returned metadata is informational; the rendered message comes
    /// from the broadcast.
    pub async fn upload(
        &self,
        filename: &str,
        mime: &str,
        data: Bytes,
        username: Option<String>,
    ) -> Result<FileMeta, TransferError> {
        let client_msg_id = Uuid::new_v4().to_string();
        {
            let mut timeline = self.timeline.lock().expect("timeline lock poisoned");
            let (_, update) =
                timeline.create_placeholder(&client_msg_id, filename, data.len() as u64);
            let _ = self.updates_tx.send(SessionUpdate::Timeline(update));
        }

        let init = match self
            .api
            .init(&UploadInitRequest {
                filename: filename.to_string(),
                size: data.len() as u64,
                mime: mime.to_string(),
                client_msg_id: client_msg_id.clone(),
                username,
            })
            .await
        {
            Ok(resp) => resp,
            Err(e) => return Err(self.fail(&client_msg_id, e)),
        };
        let upload_id = init.upload_id.clone();

        {
            let mut timeline = self.timeline.lock().expect("timeline lock poisoned");
            timeline.bind_upload(&client_msg_id, &upload_id);
        }

        let plan = match ChunkPlan::new(data.len() as u64, init.chunk_size) {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail(&client_msg_id, e)),
        };
        let total_chunks = plan.total_chunks();
        debug!(
            "upload {}: {} bytes in {} chunks",
            upload_id,
            data.len(),
            total_chunks
        );

        let (progress, mut percent_rx) = TransferProgress::new(total_chunks);
        let forwarder = {
            let timeline = self.timeline.clone();
            let updates_tx = self.updates_tx.clone();
            let client_msg_id = client_msg_id.clone();
            tokio::spawn(async move {
                while percent_rx.changed().await.is_ok() {
                    let percent = *percent_rx.borrow_and_update();
                    let update = {
                        let mut timeline = timeline.lock().expect("timeline lock poisoned");
                        timeline.set_progress(&client_msg_id, percent)
                    };
                    if let Some(update) = update {
                        let _ = updates_tx.send(SessionUpdate::Timeline(update));
                    }
                }
            })
        };

        let transfer = run_transfer(
            self.api.clone(),
            &upload_id,
            data,
            &plan,
            init.max_concurrency,
            progress.clone(),
        )
        .await;
        // Dropping our progress handle ends the forwarder once the last
        // published value is consumed.
        drop(progress);
        let _ = forwarder.await;

        if let Err(e) = transfer {
            return Err(self.fail(&client_msg_id, e));
        }

        // Finalize with the locally counted total; the server verifies it
        // has exactly these parts before assembling.
        let done = match self.api.complete(&upload_id, total_chunks).await {
            Ok(resp) => resp,
            Err(e) => return Err(self.fail(&client_msg_id, e)),
        };
        info!("upload {} complete: {}", upload_id, done.file.original_name);
        Ok(done.file)
    }

    fn fail(&self, client_msg_id: &str, e: TransferError) -> TransferError {
        let update = {
            let mut timeline = self.timeline.lock().expect("timeline lock poisoned");
            timeline.mark_failed(client_msg_id, &e.to_string())
        };
        if let Some(update) = update {
            let _ = self.updates_tx.send(SessionUpdate::Timeline(update));
        }
        e
    }
}
