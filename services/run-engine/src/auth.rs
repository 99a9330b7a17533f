//! Caller authentication.
//!
//! An [`Authenticator`] resolves a bearer API key to the environment it is
//! scoped to. Engine operations only ever see environment ids produced here.

use std::collections::HashMap;

use async_trait::async_trait;
use runway_id::EnvId;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid API key")]
    InvalidApiKey,

    #[error("authentication backend unavailable: {0}")]
    Backend(String),
}

/// Deployment tier of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentType {
    Development,
    Staging,
    Preview,
    Production,
}

impl EnvironmentType {
    /// Infers the tier from the conventional key prefix (`rw_dev_`,
    /// `rw_stg_`, `rw_prev_`, `rw_prod_`). Unprefixed keys are development
    /// keys.
    pub fn from_api_key(key: &str) -> Self {
        if key.starts_with("rw_prod_") {
            Self::Production
        } else if key.starts_with("rw_stg_") {
            Self::Staging
        } else if key.starts_with("rw_prev_") {
            Self::Preview
        } else {
            Self::Development
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "DEVELOPMENT",
            Self::Staging => "STAGING",
            Self::Preview => "PREVIEW",
            Self::Production => "PRODUCTION",
        }
    }
}

/// The environment scope a caller was authenticated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedEnvironment {
    pub env_id: EnvId,
    pub env_type: EnvironmentType,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, api_key: &str) -> Result<AuthenticatedEnvironment, AuthError>;
}

/// Fixed key table. Only sha256 digests of the keys are kept in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyAuthenticator {
    keys: HashMap<String, AuthenticatedEnvironment>,
}

impl StaticKeyAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, api_key: &str, env_id: EnvId) -> Self {
        self.insert(api_key, env_id);
        self
    }

    pub fn insert(&mut self, api_key: &str, env_id: EnvId) {
        let env = AuthenticatedEnvironment {
            env_id,
            env_type: EnvironmentType::from_api_key(api_key),
        };
        self.keys.insert(digest(api_key), env);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<(String, EnvId)> for StaticKeyAuthenticator {
    fn from_iter<I: IntoIterator<Item = (String, EnvId)>>(iter: I) -> Self {
        let mut authenticator = Self::new();
        for (key, env_id) in iter {
            authenticator.insert(&key, env_id);
        }
        authenticator
    }
}

#[async_trait]
impl Authenticator for StaticKeyAuthenticator {
    async fn authenticate(&self, api_key: &str) -> Result<AuthenticatedEnvironment, AuthError> {
        self.keys
            .get(&digest(api_key))
            .copied()
            .ok_or(AuthError::InvalidApiKey)
    }
}

fn digest(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}
