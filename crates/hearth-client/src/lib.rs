//! Client for the Hearth story-time backend.
//!
//! Uploading is a three-step handshake: ask the daemon for a presigned upload
//! URL, PUT the video straight to the blob store, then commit the story
//! metadata. Video bytes never travel through the daemon in either direction.

use hearth_db::Reader;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not signed in: {0}")]
    Auth(String),
    #[error("configuration problem: {0}")]
    Configuration(String),
    #[error("blob store rejected the upload: status {status} ({reason})")]
    Transfer { status: u16, reason: String },
    #[error("story was not saved: {0}")]
    Persistence(String),
    #[error("story not found")]
    NotFound,
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Story metadata as returned by the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct StorySummary {
    pub id: String,
    pub title: String,
    pub reader: String,
    #[serde(rename = "videoObjectKey")]
    pub video_object_key: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
struct UploadGrant {
    key: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct VideoUrlResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct StoryClient {
    http: reqwest::Client,
    base_url: String,
    session_token: String,
}

impl StoryClient {
    pub fn new(base_url: impl Into<String>, session_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            session_token: session_token.into(),
        }
    }

    /// Runs the full upload handshake and returns the committed story.
    ///
    /// Inputs are checked locally first so an obviously bad request never
    /// leaves the machine. A failed transfer leaves no story row behind; the
    /// orphaned key is simply never committed.
    pub async fn upload(
        &self,
        title: &str,
        reader: Reader,
        content_type: &str,
        video: Vec<u8>,
    ) -> Result<StorySummary, ClientError> {
        if title.trim().is_empty() {
            return Err(ClientError::Validation("title must not be empty".into()));
        }
        if !content_type.starts_with("video/") {
            return Err(ClientError::Validation(
                "a video file is required".into(),
            ));
        }

        let grant = self.request_upload_url(title, reader, content_type).await?;
        debug!(key = %grant.key, "upload URL granted");

        self.transfer(&grant.url, content_type, video).await?;

        match self.commit_story(title, reader, &grant.key).await {
            Ok(story) => Ok(story),
            Err(err) => {
                // The transferred object stays in the bucket unreferenced; a
                // retried upload mints a fresh key rather than reusing this one.
                warn!(key = %grant.key, "story commit failed; uploaded object left orphaned");
                Err(err)
            }
        }
    }

    /// Resolves a short-lived playback URL for a committed story.
    pub async fn video_url(&self, story_id: &str) -> Result<String, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/video-url", self.base_url))
            .query(&[("storyId", story_id)])
            .bearer_auth(&self.session_token)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body: VideoUrlResponse = response.json().await?;
                Ok(body.url)
            }
            StatusCode::NOT_FOUND => Err(ClientError::NotFound),
            StatusCode::BAD_REQUEST => {
                Err(ClientError::Validation(error_message(response).await))
            }
            StatusCode::UNAUTHORIZED => Err(ClientError::Auth(error_message(response).await)),
            _ => Err(ClientError::Configuration(error_message(response).await)),
        }
    }

    /// Lists all stories, newest first.
    pub async fn list_stories(&self) -> Result<Vec<StorySummary>, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/stories", self.base_url))
            .bearer_auth(&self.session_token)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::UNAUTHORIZED => Err(ClientError::Auth(error_message(response).await)),
            _ => Err(ClientError::Configuration(error_message(response).await)),
        }
    }

    async fn request_upload_url(
        &self,
        title: &str,
        reader: Reader,
        content_type: &str,
    ) -> Result<UploadGrant, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/upload-url", self.base_url))
            .bearer_auth(&self.session_token)
            .json(&serde_json::json!({
                "title": title,
                "reader": reader.as_str(),
                "contentType": content_type,
            }))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::BAD_REQUEST => {
                Err(ClientError::Validation(error_message(response).await))
            }
            StatusCode::UNAUTHORIZED => Err(ClientError::Auth(error_message(response).await)),
            status if status.is_server_error() => Err(ClientError::Configuration(format!(
                "upload URL signing failed: {}",
                error_message(response).await
            ))),
            _ => Err(ClientError::Configuration(error_message(response).await)),
        }
    }

    async fn transfer(
        &self,
        url: &str,
        content_type: &str,
        video: Vec<u8>,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .put(url)
            .header(header::CONTENT_TYPE, content_type)
            .body(video)
            .send()
            .await
            .map_err(|err| {
                // A refused connection is a bucket CORS or endpoint
                // misconfiguration; timeouts and other transient request
                // failures stay ordinary HTTP errors.
                if err.is_connect() {
                    ClientError::Configuration(
                        "the blob store closed the connection before responding; \
                         check the bucket's CORS and endpoint configuration"
                            .into(),
                    )
                } else {
                    ClientError::Http(err)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Transfer {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_owned(),
            });
        }
        Ok(())
    }

    async fn commit_story(
        &self,
        title: &str,
        reader: Reader,
        video_object_key: &str,
    ) -> Result<StorySummary, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/stories", self.base_url))
            .bearer_auth(&self.session_token)
            .json(&serde_json::json!({
                "title": title,
                "reader": reader.as_str(),
                "videoObjectKey": video_object_key,
            }))
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED => Ok(response.json().await?),
            StatusCode::UNAUTHORIZED => Err(ClientError::Auth(error_message(response).await)),
            StatusCode::BAD_REQUEST => {
                Err(ClientError::Validation(error_message(response).await))
            }
            _ => Err(ClientError::Persistence(error_message(response).await)),
        }
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    }
}
