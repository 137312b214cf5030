use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

/// On-disk staging for chunked uploads.
///
/// Each upload session gets `{chunk_dir}/{upload_id}/chunk_NNNNNN.part`
/// files; `assemble` concatenates them by index into a single file under
/// `{upload_dir}`. Nothing here survives a restart: both trees are wiped
/// on startup.
pub struct Storage {
    upload_dir: PathBuf,
    chunk_dir: PathBuf,
}

impl Storage {
    /// Create the storage, wiping any leftovers from a previous run.
    pub async fn new(upload_dir: PathBuf, chunk_dir: PathBuf) -> Result<Self> {
        let storage = Self {
            upload_dir,
            chunk_dir,
        };
        storage.reset().await?;
        info!(
            "upload storage at {} (chunks at {})",
            storage.upload_dir.display(),
            storage.chunk_dir.display()
        );
        Ok(storage)
    }

    /// Remove and recreate both directory trees.
    pub async fn reset(&self) -> Result<()> {
        for dir in [&self.upload_dir, &self.chunk_dir] {
            if fs::metadata(dir).await.is_ok() {
                fs::remove_dir_all(dir)
                    .await
                    .with_context(|| format!("wiping {}", dir.display()))?;
            }
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.chunk_dir.join(upload_id)
    }

    fn chunk_path(&self, upload_id: &str, index: usize) -> PathBuf {
        self.session_dir(upload_id)
            .join(format!("chunk_{:06}.part", index))
    }

    /// Path of an assembled file under the upload dir.
    pub fn stored_path(&self, stored_name: &str) -> PathBuf {
        self.upload_dir.join(stored_name)
    }

    pub async fn create_session_dir(&self, upload_id: &str) -> Result<()> {
        fs::create_dir_all(self.session_dir(upload_id)).await?;
        Ok(())
    }

    /// Persist one chunk. Writing the same index twice overwrites it —
    /// last write wins.
    pub async fn write_chunk(&self, upload_id: &str, index: usize, data: &[u8]) -> Result<()> {
        let dir = self.session_dir(upload_id);
        fs::create_dir_all(&dir).await?;
        let path = self.chunk_path(upload_id, index);
        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Concatenate all chunks of a session, in index order, into the final
    /// stored file. Fails without touching the upload dir if any chunk is
    /// missing. The chunk staging dir is removed afterwards.
    ///
    /// Chunk arrival order never matters: this reads strictly by index.
    pub async fn assemble(
        &self,
        upload_id: &str,
        filename: &str,
        total_chunks: usize,
    ) -> Result<(String, u64)> {
        let dir = self.session_dir(upload_id);
        if fs::metadata(&dir).await.is_err() {
            bail!("chunk directory missing for upload {}", upload_id);
        }

        for index in 0..total_chunks {
            if fs::metadata(self.chunk_path(upload_id, index)).await.is_err() {
                bail!("upload {} incomplete: chunk {} missing", upload_id, index);
            }
        }

        let stored_name = stored_name(upload_id, filename);
        let final_path = self.stored_path(&stored_name);
        let mut output = fs::File::create(&final_path)
            .await
            .with_context(|| format!("creating {}", final_path.display()))?;

        let mut written: u64 = 0;
        let mut buf = vec![0u8; 1024 * 1024];
        for index in 0..total_chunks {
            let mut part = fs::File::open(self.chunk_path(upload_id, index)).await?;
            loop {
                let n = part.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                output.write_all(&buf[..n]).await?;
                written += n as u64;
            }
        }
        output.flush().await?;

        fs::remove_dir_all(&dir).await.ok();

        info!(
            "assembled upload {} -> {} ({} bytes, {} chunks)",
            upload_id, stored_name, written, total_chunks
        );
        Ok((stored_name, written))
    }

    /// Drop a session's staged chunks (failed or abandoned upload).
    pub async fn discard_session(&self, upload_id: &str) {
        fs::remove_dir_all(self.session_dir(upload_id)).await.ok();
    }

    pub async fn file_exists(&self, stored_name: &str) -> bool {
        fs::metadata(self.stored_path(stored_name)).await.is_ok()
    }
}

/// Deterministic on-disk name for an assembled upload. Also used by the
/// media route to locate a file from its metadata alone.
pub fn stored_name(upload_id: &str, filename: &str) -> String {
    let safe_name = sanitize_filename(filename);
    if safe_name.is_empty() {
        format!("{}.bin", upload_id)
    } else {
        format!("{}_{}", upload_id, safe_name)
    }
}

/// Keep only path-safe characters; anything else becomes `_`. Leading dots
/// are stripped so a name can never escape or hide.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}
