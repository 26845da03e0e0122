//! Secret resolution for provider credentials.
//!
//! Configuration never carries a raw API key — only a [`SecretRef`] naming
//! where to find one. [`SecretResolver`] resolves a ref to a value through a
//! pluggable backend and caches the result for the lifetime of the process
//! (credentials are not expected to rotate without a restart; a future
//! backend that needs rotation can bypass the cache on its own terms).
//!
//! This generalizes the teacher's `BackendConfig::api_key()` — which reads a
//! single environment variable inline — into a backend-agnostic lookup so a
//! real vault integration can be substituted without touching any adapter.

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Where a [`SecretRef`] should be resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretBackend {
    /// Process environment variable.
    Env,
    /// A file on disk containing exactly the secret value (e.g. a mounted
    /// Kubernetes secret or Docker secret).
    File,
    /// An abstract remote key vault. No concrete implementation ships here —
    /// `RemoteVaultClient` is a trait object so a real vault SDK can be
    /// wired in without touching callers.
    RemoteVault,
}

/// A reference to a secret value, safe to store in configuration and logs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SecretRef {
    pub backend: SecretBackend,
    /// Environment variable name, file path, or vault identifier, depending
    /// on `backend`.
    pub identifier: String,
}

impl SecretRef {
    pub fn env(name: impl Into<String>) -> Self {
        Self { backend: SecretBackend::Env, identifier: name.into() }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.backend, self.identifier)
    }
}

/// A resolved secret value. `Debug` and `Display` both redact the value —
/// this type must never leak a credential into logs or error messages.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// A pluggable remote vault client. No implementation ships in this crate;
/// callers that need one register it with [`SecretResolver::with_vault_client`].
#[async_trait]
pub trait RemoteVaultClient: Send + Sync {
    async fn fetch(&self, identifier: &str) -> anyhow::Result<String>;
}

/// Resolves [`SecretRef`]s to [`Secret`] values, caching results in memory.
pub struct SecretResolver {
    cache: DashMap<SecretRef, Secret>,
    vault_client: Option<Box<dyn RemoteVaultClient>>,
}

impl SecretResolver {
    pub fn new() -> Self {
        Self { cache: DashMap::new(), vault_client: None }
    }

    pub fn with_vault_client(mut self, client: Box<dyn RemoteVaultClient>) -> Self {
        self.vault_client = Some(client);
        self
    }

    /// Resolve a secret, consulting the in-process cache first.
    ///
    /// Returns an error if the backing store has no value for this reference.
    /// Never logs or includes the resolved value in the error text.
    pub async fn resolve(&self, secret_ref: &SecretRef) -> anyhow::Result<Secret> {
        if let Some(cached) = self.cache.get(secret_ref) {
            return Ok(cached.clone());
        }

        let value = match secret_ref.backend {
            SecretBackend::Env => std::env::var(&secret_ref.identifier)
                .map_err(|_| anyhow::anyhow!("environment variable `{}` is not set", secret_ref.identifier))?,
            SecretBackend::File => std::fs::read_to_string(&secret_ref.identifier)
                .map(|s| s.trim().to_string())
                .map_err(|_| anyhow::anyhow!("secret file `{}` could not be read", secret_ref.identifier))?,
            SecretBackend::RemoteVault => {
                let client = self
                    .vault_client
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("no remote vault client registered"))?;
                client.fetch(&secret_ref.identifier).await?
            }
        };

        let secret = Secret(value);
        self.cache.insert(secret_ref.clone(), secret.clone());
        Ok(secret)
    }

    /// Best-effort resolve: returns `None` instead of an error. Used when a
    /// missing credential should simply exclude a model from routing rather
    /// than fail startup.
    pub async fn try_resolve(&self, secret_ref: &SecretRef) -> Option<Secret> {
        self.resolve(secret_ref).await.ok()
    }

    /// Drop all cached values, forcing the next `resolve` to hit the backend
    /// again. Used by admin-triggered credential rotation.
    pub fn invalidate(&self) {
        self.cache.clear();
    }
}

impl Default for SecretResolver {
    fn default() -> Self {
        Self::new()
    }
}
