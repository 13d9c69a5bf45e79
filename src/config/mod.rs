use std::path::PathBuf;

use anyhow::{Context, Result};
use dotenv::dotenv;
use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::Deserialize;

/// Process configuration, read once at startup from the environment
/// (`CYANOPICA_*` variables, optionally via `.env`) and passed into each
/// component by the entry point.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Directory holding the redb databases.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root directory of the filesystem object store.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// JWT secret for the upload/delete guard. When unset a random
    /// per-process secret is generated, which effectively disables
    /// externally-issued tokens.
    pub auth_key: Option<String>,

    /// Concurrent claim slots of the pipeline worker.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip)]
    jwt_secret: Vec<u8>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./db")
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./object")
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_port() -> u16 {
    8000
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        let mut config: AppConfig = envy::prefixed("CYANOPICA_")
            .from_env()
            .context("Failed to read configuration from environment")?;
        config.jwt_secret = match &config.auth_key {
            Some(key) => key.as_bytes().to_vec(),
            None => {
                let mut secret = vec![0u8; 32];
                OsRng
                    .try_fill_bytes(&mut secret)
                    .context("Failed to generate fallback JWT secret")?;
                secret
            }
        };
        Ok(config)
    }

    pub fn jwt_secret(&self) -> &[u8] {
        &self.jwt_secret
    }

    pub fn catalog_db_path(&self) -> PathBuf {
        self.data_dir.join("catalog.redb")
    }

    pub fn workflow_db_path(&self) -> PathBuf {
        self.data_dir.join("workflow.redb")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .context(format!("Failed to create data dir {:?}", self.data_dir))?;
        std::fs::create_dir_all(&self.storage_dir).context(format!(
            "Failed to create storage dir {:?}",
            self.storage_dir
        ))?;
        Ok(())
    }

    /// Configuration for tests and embedded use, rooted at the given
    /// directories with a fixed auth key.
    pub fn rooted(data_dir: PathBuf, storage_dir: PathBuf) -> Self {
        Self {
            data_dir,
            storage_dir,
            auth_key: Some("test-key".to_string()),
            worker_concurrency: 2,
            port: 0,
            jwt_secret: b"test-key".to_vec(),
        }
    }
}
