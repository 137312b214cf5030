//! Integration test: run the client's chunk scheduler straight into the
//! server's on-disk staging, assemble, and verify the stored file matches
//! the input byte-for-byte.

use std::sync::Arc;

use bytes::Bytes;

use parley_client::scheduler::{run_transfer, ChunkPlan, ChunkSink, TransferError, TransferProgress};
use parley_server::storage::Storage;

/// Sink that lands chunks directly in server storage, as the HTTP chunk
/// route would.
struct StorageSink {
    storage: Storage,
}

impl ChunkSink for StorageSink {
    async fn send_chunk(
        &self,
        upload_id: &str,
        index: usize,
        _total_chunks: usize,
        data: Bytes,
    ) -> Result<(), TransferError> {
        self.storage
            .write_chunk(upload_id, index, &data)
            .await
            .map_err(|e| TransferError::Chunk {
                index,
                reason: e.to_string(),
            })
    }
}

fn patterned(size: usize) -> Vec<u8> {
    // Prime modulus so chunk boundaries never align with the pattern.
    (0..size).map(|i| (i % 251) as u8).collect()
}

async fn transfer_and_assemble(file_size: usize, chunk_size: u64) {
    let tmp = tempfile::tempdir().unwrap();
    let storage = Storage::new(tmp.path().join("files"), tmp.path().join("chunks"))
        .await
        .unwrap();
    let sink = Arc::new(StorageSink { storage });

    let data = patterned(file_size);
    let plan = ChunkPlan::new(file_size as u64, chunk_size).unwrap();
    let total_chunks = plan.total_chunks();
    let (progress, _rx) = TransferProgress::new(total_chunks);

    run_transfer(
        sink.clone(),
        "it-upload",
        Bytes::from(data.clone()),
        &plan,
        3,
        progress.clone(),
    )
    .await
    .unwrap();
    assert_eq!(progress.percent(), 100);

    let (stored_name, written) = sink
        .storage
        .assemble("it-upload", "input.bin", total_chunks)
        .await
        .unwrap();
    assert_eq!(written, file_size as u64);

    let output = tokio::fs::read(sink.storage.stored_path(&stored_name))
        .await
        .unwrap();
    assert_eq!(output.len(), data.len(), "file sizes differ");
    assert_eq!(output, data, "file contents differ");
}

#[tokio::test]
async fn transfer_small_file() {
    transfer_and_assemble(1024 * 10, 1024).await;
}

#[tokio::test]
async fn transfer_with_short_tail() {
    // 25 units split by 10: two full chunks and a short one.
    transfer_and_assemble(25 * 1024, 10 * 1024).await;
}

#[tokio::test]
async fn transfer_exact_chunk_boundary() {
    transfer_and_assemble(4 * 4096, 4096).await;
}

#[tokio::test]
async fn failed_transfer_assembles_nothing() {
    struct FailingSink {
        inner: StorageSink,
    }

    impl ChunkSink for FailingSink {
        async fn send_chunk(
            &self,
            upload_id: &str,
            index: usize,
            total_chunks: usize,
            data: Bytes,
        ) -> Result<(), TransferError> {
            if index == 1 {
                return Err(TransferError::Chunk {
                    index,
                    reason: "injected failure".into(),
                });
            }
            self.inner
                .send_chunk(upload_id, index, total_chunks, data)
                .await
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    let storage = Storage::new(tmp.path().join("files"), tmp.path().join("chunks"))
        .await
        .unwrap();
    let sink = Arc::new(FailingSink {
        inner: StorageSink { storage },
    });

    let data = patterned(3 * 1024);
    let plan = ChunkPlan::new(data.len() as u64, 1024).unwrap();
    let (progress, _rx) = TransferProgress::new(plan.total_chunks());

    let err = run_transfer(sink.clone(), "it-fail", Bytes::from(data), &plan, 3, progress)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Chunk { index: 1, .. }));

    // With chunk 1 missing the server refuses to assemble, and no stored
    // file appears.
    let result = sink.inner.storage.assemble("it-fail", "input.bin", 3).await;
    assert!(result.is_err());
    assert!(!sink.inner.storage.file_exists("it-fail_input.bin").await);
}
