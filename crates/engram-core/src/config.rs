use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngramConfig {
    pub db_path: PathBuf,
    pub embedding_dimensions: usize,
    pub similarity_threshold: f32,
    pub recall_limit: usize,
    pub approval_ttl_seconds: i64,
    pub approval_poll_interval: Duration,
    pub approval_wait_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
}

impl Default for EngramConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("engram.db"),
            embedding_dimensions: 1536,
            similarity_threshold: 0.7,
            recall_limit: 5,
            approval_ttl_seconds: 3600,
            approval_poll_interval: Duration::from_millis(500),
            approval_wait_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(50),
            cache_ttl_seconds: 60,
            cache_max_entries: 1024,
        }
    }
}
