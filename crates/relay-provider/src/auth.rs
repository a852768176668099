use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Vendor;

/// Supplies API keys by provider identifier.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn get_key(&self, provider: &str) -> Option<String>;
}

/// In-memory keys, optionally backed by the process environment.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    keys: Arc<RwLock<HashMap<String, String>>>,
    use_env: bool,
}

fn canonical(provider: &str) -> String {
    Vendor::from_id(provider)
        .map(|v| v.id().to_string())
        .unwrap_or_else(|| provider.trim().to_lowercase())
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Falls back to `OPENAI_API_KEY`, `ANTHROPIC_API_KEY` and
    /// `GEMINI_API_KEY`/`GOOGLE_API_KEY` when no key was set explicitly.
    pub fn from_env() -> Self {
        Self {
            use_env: true,
            ..Self::default()
        }
    }

    pub fn with_key(self, provider: &str, key: impl Into<String>) -> Self {
        if let Ok(mut keys) = self.keys.try_write() {
            keys.insert(canonical(provider), key.into());
        }
        self
    }

    pub async fn set(&self, provider: &str, key: impl Into<String>) {
        let mut keys = self.keys.write().await;
        keys.insert(canonical(provider), key.into());
    }

    pub async fn remove(&self, provider: &str) {
        let mut keys = self.keys.write().await;
        keys.remove(&canonical(provider));
    }

    pub async fn has_key(&self, provider: &str) -> bool {
        self.get_key(provider).await.is_some()
    }

    fn env_key(provider: &str) -> Option<String> {
        let vendor = Vendor::from_id(provider)?;
        vendor
            .credential_env_vars()
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
    }
}

#[async_trait]
impl CredentialSource for CredentialStore {
    async fn get_key(&self, provider: &str) -> Option<String> {
        {
            let keys = self.keys.read().await;
            if let Some(key) = keys.get(&canonical(provider)).filter(|k| !k.is_empty()) {
                return Some(key.clone());
            }
        }
        if self.use_env {
            Self::env_key(provider)
        } else {
            None
        }
    }
}
