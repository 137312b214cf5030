use std::path::PathBuf;

/// Upload limits and storage locations, read from the environment.
///
/// `chunk_size` and `max_concurrency` are dictated to clients in the
/// `/api/upload/init` response; changing them here changes what every
/// client does on its next upload.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub upload_dir: PathBuf,
    pub chunk_dir: PathBuf,
    pub max_file_size_mb: u64,
    pub chunk_size_mb: u64,
    pub max_concurrency: usize,
}

impl UploadConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            upload_dir: std::env::var("PARLEY_UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            chunk_dir: std::env::var("PARLEY_CHUNK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.chunk_dir),
            max_file_size_mb: env_parse("PARLEY_MAX_FILE_SIZE_MB", defaults.max_file_size_mb),
            chunk_size_mb: env_parse("PARLEY_CHUNK_SIZE_MB", defaults.chunk_size_mb),
            max_concurrency: env_parse("PARLEY_MAX_CONCURRENCY", defaults.max_concurrency),
        }
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            upload_dir: "uploads/files".into(),
            chunk_dir: "uploads/chunks".into(),
            max_file_size_mb: 51200,
            chunk_size_mb: 10,
            max_concurrency: 3,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_parameters() {
        let cfg = UploadConfig::default();
        assert_eq!(cfg.chunk_size_bytes(), 10 * 1024 * 1024);
        assert_eq!(cfg.max_concurrency, 3);
        assert_eq!(cfg.max_file_size_bytes(), 51200 * 1024 * 1024);
    }

    #[test]
    fn garbage_env_value_falls_back() {
        // SAFETY: test process, no concurrent env readers for this key.
        unsafe { std::env::set_var("PARLEY_CHUNK_SIZE_MB", "not-a-number") };
        let cfg = UploadConfig::from_env();
        assert_eq!(cfg.chunk_size_mb, 10);
        unsafe { std::env::remove_var("PARLEY_CHUNK_SIZE_MB") };
    }
}
