//! The persisted API key. Kept and reported for the settings panel; the
//! download path does not read it.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::ConfigError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ApiKeyFile {
    #[serde(default)]
    api_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    Secret,
    File,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyStatus {
    pub source: KeySource,
    pub configured: bool,
    pub preview: Option<String>,
}

#[derive(Clone)]
pub struct ApiKeyStore {
    path: PathBuf,
    secret: Option<String>,
    current: Arc<RwLock<String>>,
}

impl ApiKeyStore {
    /// Loads the key: the platform secret wins, then the config file. An
    /// unreadable file is logged and treated as empty.
    pub async fn load(path: PathBuf, secret: Option<String>) -> Self {
        let current = match &secret {
            Some(secret) => secret.clone(),
            None => match read_key_file(&path).await {
                Ok(key) => key,
                Err(error) => {
                    warn!("Ignoring API key file: {error}");
                    String::new()
                }
            },
        };

        Self {
            path,
            secret,
            current: Arc::new(RwLock::new(current)),
        }
    }

    pub async fn status(&self) -> ApiKeyStatus {
        let current = self.current.read().await;
        let source = if self.secret.is_some() {
            KeySource::Secret
        } else if current.is_empty() {
            KeySource::None
        } else {
            KeySource::File
        };

        ApiKeyStatus {
            source,
            configured: !current.is_empty(),
            preview: preview(&current),
        }
    }

    pub async fn save(&self, key: &str) -> Result<ApiKeyStatus, ConfigError> {
        if self.secret.is_some() {
            return Err(ConfigError::ReadOnlySecret);
        }

        let key = key.trim().to_string();
        let payload = serde_json::to_string(&ApiKeyFile {
            api_key: key.clone(),
        })
        .map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;

        tokio::fs::write(&self.path, payload)
            .await
            .map_err(|source| ConfigError::Write {
                path: self.path.clone(),
                source,
            })?;

        *self.current.write().await = key;
        info!("Saved API key to {:?}", self.path);
        Ok(self.status().await)
    }
}

async fn read_key_file(path: &Path) -> Result<String, ConfigError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let file: ApiKeyFile =
                serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            Ok(file.api_key)
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn preview(key: &str) -> Option<String> {
    if key.is_empty() {
        return None;
    }

    let tail: String = key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    Some(format!("…{tail}"))
}
