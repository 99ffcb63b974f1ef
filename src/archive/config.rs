//!
//! 配置模块
//!

use std::fs;
use std::num::NonZeroU64;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    /// Prefix for the part and ticket URLs handed back to clients
    pub public_base_url: Url,
    pub multipart_enabled: bool,
    /// Threshold above which a download is split into parts
    pub chunk_size_bytes: NonZeroU64,
    pub object_timeout_secs: u64,
    pub progress_retention_secs: u64,
    pub progress_sweep_interval_secs: u64,
    pub progress_cleanup_delay_secs: u64,
    pub ticket_secret: Option<String>,
    pub ticket_ttl_secs: u64,
    pub storage_base_url: Url,
    pub catalog_path: String,
    pub log_file: Option<String>,
    pub log_level: String,
}

impl Config {
    pub fn load_from_file(file_path: &str) -> Result<Self> {
        let config_data = fs::read_to_string(file_path)
            .with_context(|| format!("Reading config failed: {}", file_path))?;
        let config: Config = serde_json::from_str(&config_data)
            .with_context(|| format!("Parsing config failed: {}", file_path))?;

        Ok(config)
    }

    /// Missing file means defaults, a broken file is still an error
    pub fn load_or_default(file_path: &str) -> Result<Self> {
        if Path::new(file_path).exists() {
            Self::load_from_file(file_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn object_timeout(&self) -> Duration {
        Duration::from_secs(self.object_timeout_secs)
    }

    pub fn progress_retention(&self) -> Duration {
        Duration::from_secs(self.progress_retention_secs)
    }

    pub fn progress_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.progress_sweep_interval_secs)
    }

    pub fn progress_cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.progress_cleanup_delay_secs)
    }

    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.ticket_ttl_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6060".to_string(),
            public_base_url: Url::parse("http://127.0.0.1:6060/").expect("static url"),
            multipart_enabled: true,
            chunk_size_bytes: NonZeroU64::new(2 * GIB).expect("non-zero"),
            object_timeout_secs: 30,
            progress_retention_secs: 30 * 60,
            progress_sweep_interval_secs: 5 * 60,
            progress_cleanup_delay_secs: 60,
            ticket_secret: None,
            ticket_ttl_secs: 5 * 60,
            storage_base_url: Url::parse("http://127.0.0.1:9000/photos/").expect("static url"),
            catalog_path: "catalog.json".to_string(),
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn should_fill_missing_fields_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "chunk_size_bytes": 1000, "multipart_enabled": false }}"#).unwrap();

        let config = Config::load_from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.chunk_size_bytes.get(), 1000);
        assert!(!config.multipart_enabled);
        assert_eq!(config.object_timeout(), Duration::from_secs(30));
        assert_eq!(config.ticket_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn should_reject_zero_chunk_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "chunk_size_bytes": 0 }}"#).unwrap();

        assert!(Config::load_from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn should_default_when_file_is_missing() {
        let config = Config::load_or_default("/definitely/not/here.json").unwrap();
        assert!(config.multipart_enabled);
        assert_eq!(config.chunk_size_bytes.get(), 2 * GIB);
    }
}
