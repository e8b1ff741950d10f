use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};

use crate::error::{CareError, CareResult};
use crate::models::Identity;
use crate::store::Database;

/// Resolves a session credential to the identity behind it. Issuing
/// credentials happens elsewhere; the core only ever asks this question.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn resolve(&self, credential: &str) -> CareResult<Identity>;
}

/// Opaque bearer tokens, checked against the SHA-256 digest kept on each
/// user account.
pub struct TokenAuthenticator {
    db: Arc<Database>,
}

impl TokenAuthenticator {
    pub fn new(db: Arc<Database>) -> Self {
        TokenAuthenticator { db }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn resolve(&self, credential: &str) -> CareResult<Identity> {
        if credential.is_empty() {
            return Err(CareError::Unauthorized("missing credential".into()));
        }
        let digest = hash_token(credential);
        self.db
            .read(|tables| {
                tables
                    .users
                    .values()
                    .find(|user| user.token_hash == digest)
                    .map(|user| Identity::new(user.id, user.role))
            })
            .await
            .ok_or_else(|| CareError::Unauthorized("unknown or expired credential".into()))
    }
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Picks the credential out of an `Authorization` header, falling back to
/// the `access_token` cookie. Either may carry a `Bearer ` prefix.
pub fn extract_credential(header: Option<&str>, cookie: Option<&str>) -> Option<String> {
    header
        .or(cookie)
        .map(str::trim_start)
        .map(|raw| raw.strip_prefix("Bearer ").unwrap_or(raw).trim())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Looks up one cookie in a raw `Cookie` header.
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
}
