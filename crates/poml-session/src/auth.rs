use async_trait::async_trait;
use poml_core::{Identity, PomlError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    GitHub,
    GitLab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::GitHub => "github",
            Provider::GitLab => "gitlab",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = PomlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(Provider::Google),
            "github" => Ok(Provider::GitHub),
            "gitlab" => Ok(Provider::GitLab),
            other => Err(PomlError::AuthError(format!("unknown provider '{other}'"))),
        }
    }
}

/// Hook into the external sign-in flow.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn begin_sign_in(&self, provider: Provider) -> Result<Identity>;
    async fn sign_out(&self) -> Result<()>;
}

/// Resolves a fixed local account for every provider, for offline use.
#[derive(Debug, Clone)]
pub struct LocalAuthProvider {
    username: String,
}

impl LocalAuthProvider {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }

    pub fn from_env() -> Self {
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "local".to_string());
        Self::new(username)
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    async fn begin_sign_in(&self, provider: Provider) -> Result<Identity> {
        if self.username.trim().is_empty() {
            return Err(PomlError::AuthError("local username is empty".into()));
        }
        info!("Signing in {} via {}", self.username, provider);
        Ok(Identity::authenticated(
            format!("{}-{}", provider, self.username),
            format!("{}@{}.local", self.username, provider),
        ))
    }

    async fn sign_out(&self) -> Result<()> {
        info!("Signing out {}", self.username);
        Ok(())
    }
}
