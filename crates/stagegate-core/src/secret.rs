//! Secret references.
//!
//! Plans only ever carry a pointer to a credential; the external orchestrator
//! resolves it when fetching source.

use serde::{Deserialize, Serialize};

/// Where a referenced secret is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretProvider {
    /// A managed secrets store, addressed by secret name.
    SecretsManager,
    /// An environment variable on the orchestrator host.
    Env,
}

impl std::fmt::Display for SecretProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretProvider::SecretsManager => write!(f, "secrets-manager"),
            SecretProvider::Env => write!(f, "env"),
        }
    }
}

impl std::str::FromStr for SecretProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "secrets-manager" | "secretsmanager" => Ok(SecretProvider::SecretsManager),
            "env" => Ok(SecretProvider::Env),
            _ => Err(format!("Unknown secret provider: {}", s)),
        }
    }
}

/// A reference to a credential, never the credential itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub provider: SecretProvider,
    /// Secret name (or variable name for `Env`).
    pub name: String,
    /// JSON key inside a structured secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl SecretRef {
    pub fn secrets_manager(name: impl Into<String>) -> Self {
        Self {
            provider: SecretProvider::SecretsManager,
            name: name.into(),
            key: None,
        }
    }

    pub fn env(name: impl Into<String>) -> Self {
        Self {
            provider: SecretProvider::Env,
            name: name.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl std::fmt::Display for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}:{}#{}", self.provider, self.name, key),
            None => write!(f, "{}:{}", self.provider, self.name),
        }
    }
}
