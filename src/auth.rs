use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const TOKEN_ENV: &str = "CHATWATCH_TOKEN";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("secrets file is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    gateways: BTreeMap<String, SavedToken>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SavedToken {
    token: String,
    saved_at: DateTime<Utc>,
}

/// Session tokens keyed by gateway URL. Logging out of one gateway leaves
/// the others in place.
pub struct AuthStore {
    path: PathBuf,
    api_base_url: String,
}

impl AuthStore {
    pub fn new(path: PathBuf, api_base_url: String) -> Self {
        Self { path, api_base_url }
    }

    /// `CHATWATCH_TOKEN` wins over anything saved.
    pub fn load_token(&self) -> Result<Option<String>, AuthError> {
        if let Some(token) = env::var(TOKEN_ENV).ok().and_then(non_blank) {
            return Ok(Some(token));
        }
        let secrets = self.read()?;
        Ok(secrets
            .gateways
            .get(&self.api_base_url)
            .and_then(|saved| non_blank(saved.token.clone())))
    }

    pub fn store_token(&self, token: &str) -> Result<(), AuthError> {
        let mut secrets = self.read()?;
        secrets.gateways.insert(
            self.api_base_url.clone(),
            SavedToken {
                token: token.trim().to_string(),
                saved_at: Utc::now(),
            },
        );
        self.write(&secrets)
    }

    pub fn clear_token(&self) -> Result<(), AuthError> {
        let mut secrets = self.read()?;
        if secrets.gateways.remove(&self.api_base_url).is_none() {
            return Ok(());
        }
        if secrets.gateways.is_empty() {
            return match fs::remove_file(&self.path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
                _ => Ok(()),
            };
        }
        self.write(&secrets)
    }

    fn read(&self) -> Result<SecretsFile, AuthError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(SecretsFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, secrets: &SecretsFile) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
            restrict(parent, 0o700)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(secrets)?)?;
        restrict(&self.path, 0o600)?;
        Ok(())
    }
}

fn non_blank(token: String) -> Option<String> {
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
