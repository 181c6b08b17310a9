//! Caller identity contract

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Decoded caller identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable caller id
    pub id: String,
    /// Any further claims the decoder exposes
    #[serde(default, flatten)]
    pub claims: Map<String, Value>,
}

impl Identity {
    /// Identity with no extra claims.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            claims: Map::new(),
        }
    }
}

/// Decodes a credential into a caller identity.
#[async_trait]
pub trait IdentityDecoder: Send + Sync {
    /// Decode `token`; fails with `StreamError::Auth` on an invalid or
    /// expired credential.
    async fn decode(&self, token: &SecretString) -> Result<Identity>;
}
