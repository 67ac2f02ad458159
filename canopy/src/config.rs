use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::Credential;

pub const DEFAULT_REGION: &str = "us-central1";
pub const DEFAULT_SAVED_LOGIN_KEY: &str = "canopy-login";
pub const ORG_TOKEN_ENV: &str = "CANOPY_ORG_TOKEN";

/// Endpoints of one organisation's backend, derived from its org token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionConfig {
    pub api_key: String,
    pub auth_domain: String,
    pub database_url: String,
    pub project_id: String,
    pub storage_bucket: String,
    pub messaging_sender_id: Option<String>,
    pub functions_url: String,
}

impl ConnectionConfig {
    /// Decodes `base64("org/apiKey[/messagingSenderId[/region]]")`.
    ///
    /// An empty token means "not connected" and yields `Ok(None)`.
    pub fn from_token(org_token: &str) -> Result<Option<Self>> {
        let org_token = org_token.trim();
        if org_token.is_empty() {
            return Ok(None);
        }
        let raw = STANDARD
            .decode(org_token)
            .context("org token is not valid base64")?;
        let decoded = String::from_utf8(raw).context("org token is not valid utf-8")?;

        let mut parts = decoded.split('/');
        let org = non_empty(parts.next()).ok_or_else(|| anyhow!("org token has no organisation"))?;
        let api_key = non_empty(parts.next()).ok_or_else(|| anyhow!("org token has no api key"))?;
        let messaging_sender_id = non_empty(parts.next()).map(str::to_string);
        let region = non_empty(parts.next()).unwrap_or(DEFAULT_REGION);

        Ok(Some(Self {
            api_key: api_key.to_string(),
            auth_domain: format!("{org}.firebaseapp.com"),
            database_url: format!("https://{org}.firebaseio.com"),
            project_id: org.to_string(),
            storage_bucket: format!("{org}.appspot.com"),
            messaging_sender_id,
            functions_url: format!("https://{region}-{org}.cloudfunctions.net"),
        }))
    }

    pub fn from_env() -> Result<Option<Self>> {
        Self::from_token(&std::env::var(ORG_TOKEN_ENV).unwrap_or_default())
    }

    /// Points module actions somewhere else, e.g. a local emulator.
    pub fn with_functions_url(mut self, functions_url: impl Into<String>) -> Self {
        self.functions_url = functions_url.into();
        self
    }
}

fn non_empty(part: Option<&str>) -> Option<&str> {
    part.filter(|p| !p.is_empty())
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub saved_login_key: String,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            saved_login_key: DEFAULT_SAVED_LOGIN_KEY.to_string(),
        }
    }
}

/// What gets remembered between runs under [`ControllerOptions::saved_login_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedLogin {
    pub org_token: String,
    pub credential: Credential,
}

impl SavedLogin {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("saved login is not valid json")
    }
}

/// Where saved logins live between runs, keyed by
/// [`ControllerOptions::saved_login_key`].
#[async_trait]
pub trait SavedLoginStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<SavedLogin>>;
    async fn set(&self, key: &str, login: &SavedLogin) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Keeps saved logins as JSON text for the life of the process.
#[derive(Default)]
pub struct MemoryLoginStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryLoginStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SavedLoginStore for MemoryLoginStore {
    async fn get(&self, key: &str) -> Result<Option<SavedLogin>> {
        let json = self.entries.lock().get(key).cloned();
        json.map(|json| SavedLogin::from_json(&json)).transpose()
    }

    async fn set(&self, key: &str, login: &SavedLogin) -> Result<()> {
        let json = login.to_json()?;
        self.entries.lock().insert(key.to_string(), json);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// One JSON file holding every saved login, keyed by login key.
pub struct FileLoginStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileLoginStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, SavedLogin>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("{} is not a saved login file", self.path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    async fn save(&self, logins: &BTreeMap<String, SavedLogin>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, serde_json::to_string_pretty(logins)?)
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

#[async_trait]
impl SavedLoginStore for FileLoginStore {
    async fn get(&self, key: &str) -> Result<Option<SavedLogin>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, login: &SavedLogin) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut logins = self.load().await?;
        logins.insert(key.to_string(), login.clone());
        self.save(&logins).await?;
        debug!(%key, path = %self.path.display(), "saved login");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut logins = self.load().await?;
        if logins.remove(key).is_some() {
            self.save(&logins).await?;
            debug!(%key, path = %self.path.display(), "removed saved login");
        }
        Ok(())
    }
}
