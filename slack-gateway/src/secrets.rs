//! Secret-store collaborator.
//!
//! Secrets are fetched per request. The only cache allowed is
//! [`CachedSecretStore`], which owns an explicit TTL.

use std::collections::HashMap;
use std::env;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::SecretError;

/// Source of named secret values.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<String, SecretError>;
}

/// Reads secrets from environment variables at call time.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn fetch(&self, name: &str) -> Result<String, SecretError> {
        match env::var(name) {
            Ok(value) if !value.trim().is_empty() => Ok(value),
            Ok(_) | Err(env::VarError::NotPresent) => {
                warn!(secret = name, "secret_not_found");
                Err(SecretError::NotFound(name.to_string()))
            }
            Err(e) => Err(SecretError::Backend(e.to_string())),
        }
    }
}

/// Time-bounded cache in front of another store.
pub struct CachedSecretStore<S> {
    inner: S,
    ttl: Duration,
    entries: RwLock<HashMap<String, (String, Instant)>>,
}

impl<S: SecretStore> CachedSecretStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<S: SecretStore> SecretStore for CachedSecretStore<S> {
    async fn fetch(&self, name: &str) -> Result<String, SecretError> {
        {
            let entries = self.entries.read().await;
            if let Some((value, fetched_at)) = entries.get(name) {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(value.clone());
                }
            }
        }

        let value = self.inner.fetch(name).await?;
        debug!(secret = name, ttl_secs = self.ttl.as_secs(), "secret_cache_refreshed");

        self.entries
            .write()
            .await
            .insert(name.to_string(), (value.clone(), Instant::now()));

        Ok(value)
    }
}
