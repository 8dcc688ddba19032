//! Registry credentials and mirrors for image pulls.
//!
//! Entries live in the node config under `[registries."<host>"]`:
//!
//! ```toml
//! [registries."docker.io"]
//! username = "myuser"
//! password_env = "DOCKER_HUB_TOKEN"  # Reads from env var
//!
//! [registries."registry.example.com"]
//! username = "user"
//! password = "secret"  # Direct password (not recommended)
//! mirror = "mirror.example.com"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default registry when none specified in image reference.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Per-registry configuration, keyed by registry host.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    /// Per-registry configuration entries.
    #[serde(default)]
    pub registries: HashMap<String, RegistryEntry>,
}

/// Configuration for a single registry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryEntry {
    /// Username for authentication.
    pub username: Option<String>,
    /// Password (plaintext - not recommended, use password_env instead).
    pub password: Option<String>,
    /// Environment variable containing the password.
    pub password_env: Option<String>,
    /// Mirror host to pull from instead of this registry.
    pub mirror: Option<String>,
}

/// Resolved username and password.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl RegistryAuth {
    /// `user:password` form accepted by skopeo's `--src-creds`.
    pub fn to_creds_arg(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }
}

/// Where an image is actually pulled from.
#[derive(Debug, Clone)]
pub struct PullSource {
    /// Image reference after mirror rewriting.
    pub reference: String,
    /// Credentials for the registry the reference points at.
    pub auth: Option<RegistryAuth>,
}

impl RegistryConfig {
    /// Credentials for `host`, if its entry has a username and a password.
    ///
    /// `password_env` wins over an inline `password` when the variable is set.
    pub fn credentials_for(&self, host: &str) -> Option<RegistryAuth> {
        let entry = self.registries.get(host)?;
        let username = entry.username.clone()?;

        let from_env = entry.password_env.as_deref().and_then(|var| match std::env::var(var) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::debug!(registry = %host, env_var = %var, "registry password variable unset");
                None
            }
        });
        let password = from_env.or_else(|| entry.password.clone())?;

        Some(RegistryAuth { username, password })
    }

    /// Mirror configured for `host`.
    pub fn mirror_for(&self, host: &str) -> Option<&str> {
        self.registries.get(host).and_then(|e| e.mirror.as_deref())
    }

    /// Resolve the reference and credentials used to pull `image`.
    ///
    /// A configured mirror replaces the registry. Credentials are looked up
    /// for the mirror first, then for the original registry.
    pub fn resolve(&self, image: &str) -> PullSource {
        let host = registry_host(image);
        let Some(mirror) = self.mirror_for(host) else {
            return PullSource {
                reference: image.to_string(),
                auth: self.credentials_for(host),
            };
        };

        tracing::debug!(registry = %host, mirror = %mirror, "pulling through mirror");
        PullSource {
            reference: with_registry(image, mirror),
            auth: self
                .credentials_for(mirror)
                .or_else(|| self.credentials_for(host)),
        }
    }
}

/// Registry host named by an image reference, `docker.io` when implicit.
///
/// The first path component is a host only if it has a dot or a port.
pub fn registry_host(image: &str) -> &str {
    match image.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') => first,
        _ => DEFAULT_REGISTRY,
    }
}

/// `image` with its registry replaced by `host`.
pub fn with_registry(image: &str, host: &str) -> String {
    match image.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') => {
            format!("{}/{}", host, rest)
        }
        Some(_) => format!("{}/{}", host, image),
        // Official images live under library/
        None => format!("{}/library/{}", host, image),
    }
}
