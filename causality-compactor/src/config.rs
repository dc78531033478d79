use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    // Object store
    #[serde(default = "default_store_endpoint")]
    pub store_endpoint: String,
    #[serde(default = "default_store_access_key")]
    pub store_access_key: String,
    #[serde(default = "default_store_secret_key")]
    pub store_secret_key: String,
    #[serde(default = "default_store_region")]
    pub store_region: String,
    #[serde(default = "default_store_bucket")]
    pub store_bucket: String,
    #[serde(default = "default_store_prefix")]
    pub store_prefix: String,

    // Compaction policy
    #[serde(default = "default_target_size_bytes")]
    pub target_size_bytes: i64,
    #[serde(default = "default_min_files")]
    pub min_files: usize,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_port() -> u16 {
    8083
}
fn default_store_endpoint() -> String {
    "http://localhost:9000".into()
}
fn default_store_access_key() -> String {
    "minioadmin".into()
}
fn default_store_secret_key() -> String {
    "minioadmin".into()
}
fn default_store_region() -> String {
    "us-east-1".into()
}
fn default_store_bucket() -> String {
    "causality-warehouse".into()
}
fn default_store_prefix() -> String {
    "events".into()
}
fn default_target_size_bytes() -> i64 {
    128 * 1024 * 1024
}
fn default_min_files() -> usize {
    2
}
fn default_interval_secs() -> u64 {
    3600
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CAUSALITY_COMPACTOR").separator("__"))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
