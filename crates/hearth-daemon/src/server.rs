use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use crate::auth::{AuthError, SessionGate, SessionInfo};
use crate::keygen;
use crate::storage::{S3SignedUrls, SignedUrlService, DEFAULT_SIGNED_URL_TTL_SECS};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Duration as ChronoDuration;
use hearth_db::{Database, NewStory, Reader, StoryError, StoryRecord};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{IntoParams, Modify, OpenApi, ToSchema};
use uuid::Uuid;

/// One week; family phones stay signed in between visits.
const DEFAULT_SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;

    let signer: Arc<dyn SignedUrlService> =
        Arc::new(S3SignedUrls::from_env().context("initializing blob store signer")?);
    let sessions = Arc::new(SessionGate::new(
        db.clone(),
        config.idp_shared_secret.clone(),
    ));
    let state = Arc::new(AppState {
        db,
        sessions,
        signer,
        signed_url_ttl_secs: config.signed_url_ttl_secs,
        session_ttl: Duration::from_secs(config.session_ttl_secs),
    });

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "hearth-daemon listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    Ok(())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/upload-url", post(create_upload_url))
        .route("/api/video-url", get(resolve_video_url))
        .route("/api/stories", post(create_story).get(list_stories))
        .route("/api/stories/:id", get(get_story))
        .route("/api/auth/sessions", post(provision_session))
        .route("/api/auth/sessions/:id", delete(revoke_session))
        .with_state(state)
}

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub sessions: Arc<SessionGate>,
    pub signer: Arc<dyn SignedUrlService>,
    pub signed_url_ttl_secs: u32,
    pub session_ttl: Duration,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    db_url: String,
    signed_url_ttl_secs: u32,
    session_ttl_secs: u64,
    idp_shared_secret: Option<Vec<u8>>,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("HEARTH_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid HEARTH_API_ADDR")?;

        let db_url = env::var("HEARTH_DB_DSN")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("HEARTH_DB_DSN or DATABASE_URL must be configured")?;

        let signed_url_ttl_secs = match env::var("HEARTH_SIGNED_URL_TTL_SECONDS") {
            Ok(value) => value
                .trim()
                .parse()
                .context("invalid HEARTH_SIGNED_URL_TTL_SECONDS")?,
            Err(_) => DEFAULT_SIGNED_URL_TTL_SECS,
        };

        let session_ttl_secs = match env::var("HEARTH_SESSION_TTL_SECONDS") {
            Ok(value) => value
                .trim()
                .parse()
                .context("invalid HEARTH_SESSION_TTL_SECONDS")?,
            Err(_) => DEFAULT_SESSION_TTL_SECS,
        };

        let idp_shared_secret = match env::var("HEARTH_IDP_SHARED_SECRET") {
            Ok(value) => {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(
                        STANDARD
                            .decode(trimmed)
                            .context("invalid base64 in HEARTH_IDP_SHARED_SECRET")?,
                    )
                }
            }
            Err(_) => None,
        };

        Ok(Self {
            listen_addr,
            db_url,
            signed_url_ttl_secs,
            session_ttl_secs,
            idp_shared_secret,
        })
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    post,
    path = "/api/upload-url",
    request_body = UploadUrlBody,
    responses(
        (status = 200, description = "Presigned upload URL minted", body = UploadUrlResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 500, description = "Signing failed", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn create_upload_url(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<UploadUrlBody>,
) -> Result<Json<UploadUrlResponse>, ApiError> {
    state
        .sessions
        .authorize(require_bearer(&headers)?)
        .await
        .map_err(ApiError::from)?;

    let title = validate_title(&payload.title)?;
    let reader = validate_reader(&payload.reader)?;
    let content_type = validate_content_type(&payload.content_type)?;

    let key = keygen::object_key(reader, title, content_type);
    let url = state
        .signer
        .sign_for_write(&key, content_type, state.signed_url_ttl_secs)
        .await
        .map_err(ApiError::internal)?;

    info!(key = %key, reader = reader.as_str(), "upload URL issued");
    Ok(Json(UploadUrlResponse { key, url }))
}

#[utoipa::path(
    get,
    path = "/api/video-url",
    params(VideoUrlQuery),
    responses(
        (status = 200, description = "Presigned playback URL", body = VideoUrlResponse),
        (status = 400, description = "Missing storyId", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Story not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn resolve_video_url(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<VideoUrlQuery>,
) -> Result<Json<VideoUrlResponse>, ApiError> {
    state
        .sessions
        .authorize(require_bearer(&headers)?)
        .await
        .map_err(ApiError::from)?;

    // An empty or whitespace-only value counts as absent.
    let raw_id = query
        .story_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing storyId"))?;

    // A malformed id addresses no story; callers see the same answer as for
    // a deleted one.
    let id = Uuid::parse_str(raw_id).map_err(|_| story_not_found())?;
    let story = state
        .db
        .fetch_story(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(story_not_found)?;

    let url = state
        .signer
        .sign_for_read(&story.video_object_key, state.signed_url_ttl_secs)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(VideoUrlResponse { url }))
}

#[utoipa::path(
    post,
    path = "/api/stories",
    request_body = CreateStoryBody,
    responses(
        (status = 201, description = "Story committed", body = StoryResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 409, description = "Object key already claimed", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn create_story(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateStoryBody>,
) -> Result<(StatusCode, Json<StoryResponse>), ApiError> {
    state
        .sessions
        .authorize(require_bearer(&headers)?)
        .await
        .map_err(ApiError::from)?;

    let title = validate_title(&payload.title)?;
    let reader = validate_reader(&payload.reader)?;
    let video_object_key = payload.video_object_key.trim();
    if video_object_key.is_empty() {
        return Err(ApiError::bad_request("videoObjectKey must not be empty"));
    }

    let record = state
        .db
        .insert_story(NewStory {
            title,
            reader,
            video_object_key,
        })
        .await
        .map_err(|err| match err.downcast::<StoryError>() {
            Ok(StoryError::DuplicateObjectKey(key)) => ApiError::new(
                StatusCode::CONFLICT,
                format!("object key '{key}' is already referenced by another story"),
            ),
            Ok(other) => ApiError::internal(other),
            Err(err) => ApiError::internal(err),
        })?;

    info!(story_id = %record.id, key = %record.video_object_key, "story committed");
    Ok((StatusCode::CREATED, Json(StoryResponse::from(record))))
}

#[utoipa::path(
    get,
    path = "/api/stories",
    responses(
        (status = 200, description = "List stories, newest first", body = [StoryResponse]),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn list_stories(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<StoryResponse>>, ApiError> {
    state
        .sessions
        .authorize(require_bearer(&headers)?)
        .await
        .map_err(ApiError::from)?;

    let stories = state.db.list_stories().await.map_err(ApiError::internal)?;
    Ok(Json(stories.into_iter().map(StoryResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/api/stories/{id}",
    params(("id" = Uuid, Path, description = "Story identifier")),
    responses(
        (status = 200, description = "Story metadata", body = StoryResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Story not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn get_story(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<StoryResponse>, ApiError> {
    state
        .sessions
        .authorize(require_bearer(&headers)?)
        .await
        .map_err(ApiError::from)?;

    let story = state
        .db
        .fetch_story(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(story_not_found)?;

    Ok(Json(StoryResponse::from(story)))
}

#[utoipa::path(
    post,
    path = "/api/auth/sessions",
    request_body = ProvisionSessionBody,
    responses(
        (status = 201, description = "Session issued", body = IssuedSessionResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 401, description = "Missing or invalid signature", body = ErrorBody),
        (status = 503, description = "Provisioning secret not configured", body = ErrorBody)
    )
)]
async fn provision_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IssuedSessionResponse>), ApiError> {
    let signature = headers
        .get("X-Hearth-Idp-Signature")
        .ok_or_else(|| ApiError::unauthorized("missing X-Hearth-Idp-Signature header"))?
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid signature header encoding"))?;

    state
        .sessions
        .verify_provisioning_signature(&body, signature)
        .map_err(ApiError::from)?;

    let payload: ProvisionSessionBody = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("invalid session payload: {err}")))?;

    let user = payload.user.trim();
    if user.is_empty() {
        return Err(ApiError::bad_request("user must not be empty"));
    }

    let ttl = match payload.ttl_seconds {
        Some(secs) => {
            let requested = Duration::from_secs(secs);
            if ChronoDuration::from_std(requested).is_err() {
                return Err(ApiError::bad_request("ttlSeconds is out of range"));
            }
            requested
        }
        None => state.session_ttl,
    };
    let issued = state
        .sessions
        .issue_session(user, Some(ttl))
        .await
        .map_err(ApiError::internal)?;

    info!(user, session_id = %issued.info.id, "session provisioned");
    Ok((
        StatusCode::CREATED,
        Json(IssuedSessionResponse {
            token: issued.token,
            info: issued.info,
        }),
    ))
}

#[utoipa::path(
    delete,
    path = "/api/auth/sessions/{id}",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 204, description = "Session revoked"),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "Session not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn revoke_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .sessions
        .authorize(require_bearer(&headers)?)
        .await
        .map_err(ApiError::from)?;

    state.sessions.revoke(id).await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

fn validate_title(raw: &str) -> Result<&str, ApiError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    Ok(title)
}

fn validate_reader(raw: &str) -> Result<Reader, ApiError> {
    Reader::from_str(raw.trim()).map_err(|_| {
        let allowed: Vec<&str> = Reader::ALL.iter().map(Reader::as_str).collect();
        ApiError::bad_request(format!("reader must be one of: {}", allowed.join(", ")))
    })
}

fn validate_content_type(raw: &str) -> Result<&str, ApiError> {
    let content_type = raw.trim();
    if !content_type.starts_with("video/") {
        return Err(ApiError::bad_request(
            "contentType must start with \"video/\"",
        ));
    }
    Ok(content_type)
}

fn story_not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "Story not found")
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct UploadUrlBody {
    title: String,
    reader: String,
    content_type: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct UploadUrlResponse {
    key: String,
    url: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct VideoUrlQuery {
    #[serde(rename = "storyId")]
    story_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct VideoUrlResponse {
    url: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct CreateStoryBody {
    title: String,
    reader: String,
    video_object_key: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct StoryResponse {
    id: Uuid,
    title: String,
    reader: String,
    video_object_key: String,
    created_at: String,
}

impl From<StoryRecord> for StoryResponse {
    fn from(record: StoryRecord) -> Self {
        Self {
            id: record.id,
            title: record.title,
            reader: record.reader.as_str().to_string(),
            video_object_key: record.video_object_key,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ProvisionSessionBody {
    user: String,
    #[serde(default)]
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
struct IssuedSessionResponse {
    token: String,
    #[schema(value_type = Object)]
    info: SessionInfo,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidToken => ApiError::unauthorized("invalid session token"),
            AuthError::NotFound => ApiError::new(StatusCode::NOT_FOUND, "session not found"),
            AuthError::ProvisioningNotConfigured => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "session provisioning secret is not configured",
            ),
            AuthError::InvalidSignature => {
                ApiError::unauthorized("invalid session provisioning signature")
            }
            AuthError::Internal(message) => ApiError::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

fn require_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let header_value = value
            .to_str()
            .map_err(|_| ApiError::unauthorized("invalid Authorization header encoding"))?;
        if let Some(token) = header_value.strip_prefix("Bearer ") {
            Ok(token.trim())
        } else {
            Err(ApiError::unauthorized(
                "Authorization header must be a Bearer token",
            ))
        }
    } else {
        Err(ApiError::unauthorized(
            "missing Authorization bearer token",
        ))
    }
}

pub mod docs {
    use super::*;
    use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityRequirement, SecurityScheme};

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Hearth Daemon API", version = "0.1.0"),
        paths(
            healthz,
            create_upload_url,
            resolve_video_url,
            create_story,
            list_stories,
            get_story,
            provision_session,
            revoke_session
        ),
        components(
            schemas(
                UploadUrlBody,
                UploadUrlResponse,
                VideoUrlResponse,
                CreateStoryBody,
                StoryResponse,
                ProvisionSessionBody,
                IssuedSessionResponse,
                ErrorBody
            )
        ),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            let components = openapi.components.get_or_insert_with(Default::default);
            components.add_security_scheme(
                "bearerAuth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("Session Token")
                        .description(Some(
                            "Bearer token issued via /api/auth/sessions".to_string(),
                        ))
                        .build(),
                ),
            );
            openapi
                .security
                .get_or_insert_with(Default::default)
                .push(SecurityRequirement::new("bearerAuth", Vec::<String>::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use hmac::{Hmac, Mac};
    use serde_json::{json, Value};
    use sha2::Sha256;
    use tempfile::TempDir;
    use tower::Service;

    use crate::storage::S3Config;

    const IDP_SECRET: &[u8] = b"idp-secret";

    async fn setup_test_app() -> (Arc<AppState>, Router, TempDir) {
        let temp = TempDir::new().expect("tempdir");
        let db_path = temp.path().join(format!("db-{}.sqlite", Uuid::new_v4()));
        let db = Database::connect_file(&db_path).await.expect("db");

        let signer = S3SignedUrls::new(&S3Config {
            endpoint: "http://127.0.0.1:9000".to_string(),
            region: "us-east-1".to_string(),
            bucket: "hearth-test".to_string(),
            access_key: "test-access".to_string(),
            secret_key: "test-secret".to_string(),
        })
        .expect("signer");

        let sessions = Arc::new(SessionGate::new(db.clone(), Some(IDP_SECRET.to_vec())));
        let state = Arc::new(AppState {
            db: db.clone(),
            sessions,
            signer: Arc::new(signer),
            signed_url_ttl_secs: 900,
            session_ttl: Duration::from_secs(3600),
        });
        let router = build_router(state.clone());
        (state, router, temp)
    }

    async fn issue_token(state: &Arc<AppState>) -> String {
        state
            .sessions
            .issue_session("granny", None)
            .await
            .expect("session")
            .token
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn upload_url_requires_session() {
        let (_state, mut router, _tmp) = setup_test_app().await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/upload-url")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&json!({
                    "title": "The Magical Forest",
                    "reader": "granny",
                    "contentType": "video/mp4"
                }))
                .unwrap(),
            ))
            .expect("request");

        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn upload_url_validates_fields_in_order() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let token = issue_token(&state).await;

        let cases = [
            (
                json!({"title": "   ", "reader": "granny", "contentType": "video/mp4"}),
                "title must not be empty",
            ),
            (
                json!({"title": "Tale", "reader": "uncle", "contentType": "video/mp4"}),
                "reader must be one of: granny, grandpa",
            ),
            (
                json!({"title": "Tale", "reader": "granny", "contentType": "image/png"}),
                "contentType must start with \"video/\"",
            ),
        ];

        for (payload, expected) in cases {
            let request = Request::builder()
                .method("POST")
                .uri("/api/upload-url")
                .header("content-type", "application/json")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                .expect("request");

            let response = router.call(request).await.expect("response");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = body_json(response).await;
            assert_eq!(body["error"], expected);
        }
    }

    #[tokio::test]
    async fn upload_url_returns_key_and_presigned_url() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let token = issue_token(&state).await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/upload-url")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(
                serde_json::to_vec(&json!({
                    "title": "The Magical Forest",
                    "reader": "granny",
                    "contentType": "video/mp4"
                }))
                .unwrap(),
            ))
            .expect("request");

        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;

        let key = body["key"].as_str().unwrap();
        assert!(key.starts_with("videos/granny/"));
        assert!(key.contains("the-magical-forest-"));
        assert!(key.ends_with(".mp4"));

        let url = body["url"].as_str().unwrap();
        assert!(url.contains(key));
        assert!(url.contains("X-Amz-Expires=900"));
    }

    #[tokio::test]
    async fn video_url_without_story_id_is_bad_request() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let token = issue_token(&state).await;

        for uri in [
            "/api/video-url",
            "/api/video-url?storyId=",
            "/api/video-url?storyId=%20%20",
        ] {
            let request = Request::builder()
                .method("GET")
                .uri(uri)
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .expect("request");

            let response = router.call(request).await.expect("response");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = body_json(response).await;
            assert_eq!(body["error"], "Missing storyId");
        }
    }

    #[tokio::test]
    async fn video_url_for_unknown_story_is_not_found() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let token = issue_token(&state).await;

        for story_id in ["nonexistent-id", &Uuid::new_v4().to_string()] {
            let request = Request::builder()
                .method("GET")
                .uri(format!("/api/video-url?storyId={story_id}"))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .expect("request");

            let response = router.call(request).await.expect("response");
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let body = body_json(response).await;
            assert_eq!(body["error"], "Story not found");
        }
    }

    #[tokio::test]
    async fn committed_story_is_listed_and_playable() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let token = issue_token(&state).await;
        let key = "videos/granny/2026-08/the-magical-forest-a1b2c3.mp4";

        let request = Request::builder()
            .method("POST")
            .uri("/api/stories")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(
                serde_json::to_vec(&json!({
                    "title": "The Magical Forest",
                    "reader": "granny",
                    "videoObjectKey": key
                }))
                .unwrap(),
            ))
            .expect("request");

        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let story = body_json(response).await;
        assert_eq!(story["videoObjectKey"], key);
        let story_id = story["id"].as_str().unwrap().to_string();

        let list_request = Request::builder()
            .method("GET")
            .uri("/api/stories")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .expect("list request");
        let list_response = router.call(list_request).await.expect("list response");
        assert_eq!(list_response.status(), StatusCode::OK);
        let stories = body_json(list_response).await;
        assert_eq!(stories.as_array().unwrap().len(), 1);
        assert_eq!(stories[0]["id"], story["id"]);

        let play_request = Request::builder()
            .method("GET")
            .uri(format!("/api/video-url?storyId={story_id}"))
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .expect("play request");
        let play_response = router.call(play_request).await.expect("play response");
        assert_eq!(play_response.status(), StatusCode::OK);
        let play = body_json(play_response).await;
        assert!(play["url"].as_str().unwrap().contains(key));
    }

    #[tokio::test]
    async fn duplicate_object_key_commit_conflicts() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let token = issue_token(&state).await;
        let payload = json!({
            "title": "Same Story",
            "reader": "grandpa",
            "videoObjectKey": "videos/grandpa/2026-08/same-story-xyz123.mp4"
        });

        for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
            let request = Request::builder()
                .method("POST")
                .uri("/api/stories")
                .header("content-type", "application/json")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                .expect("request");

            let response = router.call(request).await.expect("response");
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn provision_session_verifies_idp_signature() {
        let (_state, mut router, _tmp) = setup_test_app().await;
        let body = serde_json::to_vec(&json!({"user": "granny"})).unwrap();

        let mut mac = Hmac::<Sha256>::new_from_slice(IDP_SECRET).unwrap();
        mac.update(&body);
        let signature = hex::encode(mac.finalize().into_bytes());

        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/sessions")
            .header("content-type", "application/json")
            .header("X-Hearth-Idp-Signature", signature)
            .body(Body::from(body.clone()))
            .expect("request");

        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let issued = body_json(response).await;
        assert!(!issued["token"].as_str().unwrap().is_empty());

        let forged = Request::builder()
            .method("POST")
            .uri("/api/auth/sessions")
            .header("content-type", "application/json")
            .header("X-Hearth-Idp-Signature", "00ff00ff")
            .body(Body::from(body))
            .expect("forged request");

        let forged_response = router.call(forged).await.expect("forged response");
        assert_eq!(forged_response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn provision_session_rejects_out_of_range_ttl() {
        let (_state, mut router, _tmp) = setup_test_app().await;
        let body =
            serde_json::to_vec(&json!({"user": "granny", "ttlSeconds": u64::MAX})).unwrap();

        let mut mac = Hmac::<Sha256>::new_from_slice(IDP_SECRET).unwrap();
        mac.update(&body);
        let signature = hex::encode(mac.finalize().into_bytes());

        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/sessions")
            .header("content-type", "application/json")
            .header("X-Hearth-Idp-Signature", signature)
            .body(Body::from(body))
            .expect("request");

        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "ttlSeconds is out of range");
    }

    #[tokio::test]
    async fn revoked_session_stops_working() {
        let (state, mut router, _tmp) = setup_test_app().await;
        let issued = state
            .sessions
            .issue_session("grandpa", None)
            .await
            .expect("session");

        let revoke_request = Request::builder()
            .method("DELETE")
            .uri(format!("/api/auth/sessions/{}", issued.info.id))
            .header("authorization", format!("Bearer {}", issued.token))
            .body(Body::empty())
            .expect("revoke request");
        let revoke_response = router.call(revoke_request).await.expect("revoke response");
        assert_eq!(revoke_response.status(), StatusCode::NO_CONTENT);

        let list_request = Request::builder()
            .method("GET")
            .uri("/api/stories")
            .header("authorization", format!("Bearer {}", issued.token))
            .body(Body::empty())
            .expect("list request");
        let list_response = router.call(list_request).await.expect("list response");
        assert_eq!(list_response.status(), StatusCode::UNAUTHORIZED);
    }
}
