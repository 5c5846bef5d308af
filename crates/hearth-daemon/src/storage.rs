//! Signed-URL access to the S3-compatible blob store.
//!
//! The daemon never proxies video bytes. It mints short-lived presigned URLs
//! and hands them to the browser, which talks to the bucket directly. Signing
//! is a purely local HMAC computation over the daemon's credentials, so no
//! network round trip happens here.

use anyhow::{Context, Result};
use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use thiserror::Error;
use tracing::debug;

/// Default lifetime of a presigned URL, in seconds.
pub const DEFAULT_SIGNED_URL_TTL_SECS: u32 = 900;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("signing failed for object '{key}': {message}")]
    Signing { key: String, message: String },
}

/// Mints presigned URLs for direct browser access to the blob store.
#[async_trait]
pub trait SignedUrlService: Send + Sync {
    /// Presigns a PUT for a not-yet-existing object. The content type is
    /// recorded for tracing; enforcement of "video/*" happens at the API gate
    /// before a key is ever minted.
    async fn sign_for_write(
        &self,
        key: &str,
        content_type: &str,
        ttl_secs: u32,
    ) -> Result<String, StorageError>;

    /// Presigns a GET for an existing object.
    async fn sign_for_read(&self, key: &str, ttl_secs: u32) -> Result<String, StorageError>;
}

/// Connection settings for the bucket, read from the environment.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

impl S3Config {
    pub fn from_env() -> Result<Self> {
        let endpoint = std::env::var("HEARTH_S3_ENDPOINT")
            .context("HEARTH_S3_ENDPOINT must point at the blob store")?;
        let region = std::env::var("HEARTH_S3_REGION").unwrap_or_else(|_| "us-east-1".to_owned());
        let bucket =
            std::env::var("HEARTH_S3_BUCKET").context("HEARTH_S3_BUCKET must be configured")?;
        let access_key = std::env::var("HEARTH_S3_ACCESS_KEY")
            .context("HEARTH_S3_ACCESS_KEY must be configured")?;
        let secret_key = std::env::var("HEARTH_S3_SECRET_KEY")
            .context("HEARTH_S3_SECRET_KEY must be configured")?;

        Ok(Self {
            endpoint,
            region,
            bucket,
            access_key,
            secret_key,
        })
    }
}

/// `SignedUrlService` backed by an S3-compatible bucket (R2, MinIO, AWS).
pub struct S3SignedUrls {
    bucket: Bucket,
}

impl S3SignedUrls {
    pub fn new(config: &S3Config) -> Result<Self> {
        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
        };
        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )
        .context("invalid blob store credentials")?;

        let bucket = Bucket::new(&config.bucket, region, credentials)
            .context("failed to set up bucket client")?
            .with_path_style();

        Ok(Self { bucket: *bucket })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(&S3Config::from_env()?)
    }
}

#[async_trait]
impl SignedUrlService for S3SignedUrls {
    async fn sign_for_write(
        &self,
        key: &str,
        content_type: &str,
        ttl_secs: u32,
    ) -> Result<String, StorageError> {
        debug!(key, content_type, ttl_secs, "presigning upload URL");
        self.bucket
            .presign_put(key, ttl_secs, None, None)
            .await
            .map_err(|err| StorageError::Signing {
                key: key.to_owned(),
                message: err.to_string(),
            })
    }

    async fn sign_for_read(&self, key: &str, ttl_secs: u32) -> Result<String, StorageError> {
        debug!(key, ttl_secs, "presigning playback URL");
        self.bucket
            .presign_get(key, ttl_secs, None)
            .await
            .map_err(|err| StorageError::Signing {
                key: key.to_owned(),
                message: err.to_string(),
            })
    }
}
