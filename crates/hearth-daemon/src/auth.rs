use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hearth_db::{Database, NewSession, SessionRecord};
use hmac::{Hmac, Mac};
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Session details safe to hand back to callers. The token itself is only
/// released once at issue time; afterwards the prefix is all that remains.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub user_name: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub token_prefix: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedSession {
    pub token: String,
    pub info: SessionInfo,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid or unknown session token")]
    InvalidToken,
    #[error("session not found")]
    NotFound,
    #[error("session provisioning secret is not configured")]
    ProvisioningNotConfigured,
    #[error("session provisioning signature does not verify")]
    InvalidSignature,
    #[error("{0}")]
    Internal(String),
}

/// Bearer-token gate in front of every story and playback operation.
///
/// Sessions are minted by the family's identity provider calling the
/// provisioning endpoint with an HMAC-signed body; the gate stores only the
/// SHA-256 of each token.
#[derive(Clone)]
pub struct SessionGate {
    db: Database,
    provisioning_secret: Option<Vec<u8>>,
}

impl SessionGate {
    pub fn new(db: Database, provisioning_secret: Option<Vec<u8>>) -> Self {
        Self {
            db,
            provisioning_secret,
        }
    }

    pub async fn issue_session(
        &self,
        user_name: &str,
        ttl: Option<Duration>,
    ) -> Result<IssuedSession> {
        let token = generate_token();
        let hash = hash_token(&token);
        let now = Utc::now();
        let expires_at = match ttl {
            Some(dur) => {
                let offset = ChronoDuration::from_std(dur)
                    .map_err(|_| anyhow!("session ttl {}s is out of range", dur.as_secs()))?;
                Some(now + offset)
            }
            None => None,
        };

        let token_prefix: String = token.chars().take(12).collect();
        let record = self
            .db
            .insert_session(NewSession {
                token_hash: &hash,
                token_prefix: &token_prefix,
                user_name,
                expires_at,
            })
            .await?;

        Ok(IssuedSession {
            token,
            info: session_info_from_record(record),
        })
    }

    pub async fn authorize(&self, token: &str) -> Result<SessionInfo, AuthError> {
        let hash = hash_token(token);

        let mut record = self
            .db
            .find_session_by_hash(&hash)
            .await
            .map_err(|_| AuthError::InvalidToken)?
            .ok_or(AuthError::InvalidToken)?;

        if record.revoked {
            return Err(AuthError::InvalidToken);
        }

        if let Some(expiry) = record.expires_at {
            if expiry < Utc::now() {
                return Err(AuthError::InvalidToken);
            }
        }

        let now = Utc::now();
        self.db
            .touch_session_usage(record.id, now)
            .await
            .map_err(|_| AuthError::InvalidToken)?;

        record.last_seen_at = Some(now);
        Ok(session_info_from_record(record))
    }

    pub async fn revoke(&self, id: Uuid) -> Result<(), AuthError> {
        if self
            .db
            .fetch_session(id)
            .await
            .map_err(|_| AuthError::NotFound)?
            .is_none()
        {
            return Err(AuthError::NotFound);
        }

        self.db
            .revoke_session(id)
            .await
            .map_err(|_| AuthError::NotFound)
    }

    /// Checks the identity provider's HMAC-SHA256 signature over the raw
    /// request body. The signature arrives hex-encoded.
    pub fn verify_provisioning_signature(
        &self,
        body: &[u8],
        signature_hex: &str,
    ) -> Result<(), AuthError> {
        let secret = self
            .provisioning_secret
            .as_deref()
            .ok_or(AuthError::ProvisioningNotConfigured)?;

        let signature =
            hex::decode(signature_hex.trim()).map_err(|_| AuthError::InvalidSignature)?;

        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|err| AuthError::Internal(err.to_string()))?;
        mac.update(body);
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidSignature)
    }
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn session_info_from_record(record: SessionRecord) -> SessionInfo {
    let SessionRecord {
        id,
        token_prefix,
        user_name,
        created_at,
        last_seen_at,
        expires_at,
        token_hash: _,
        revoked: _,
    } = record;

    SessionInfo {
        id,
        user_name,
        created_at,
        last_seen_at,
        expires_at,
        token_prefix,
    }
}
