use crate::accounts::{AccountService, LoginRequest, RegisterRequest};
use crate::chunk_receiver::UploadChunk;
use crate::config::ApiConfig;
use crate::error::Error;
use crate::image_service::ImageService;
use crate::metadata_store::MetadataStore;
use crate::models::{Folder, Image, User};
use crate::move_orchestrator::{MoveOutcome, MoveRequest};
use crate::tokens::{TokenKind, TokenService};
use anyhow::Context;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

type ApiResult<T> = Result<T, Error>;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub images: Arc<ImageService>,
    pub accounts: Arc<AccountService>,
    pub tokens: Arc<dyn TokenService>,
    pub metadata_store: Arc<dyn MetadataStore>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::ObjectStore(_) | Error::CopyFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self, code = self.code(), "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Caller identified by a valid access token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub username: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Error> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| Error::Unauthorized("missing bearer token".to_string()))?;

        let claims = state.tokens.verify(token.trim())?;
        if claims.kind != TokenKind::Access {
            return Err(Error::Unauthorized("not an access token".to_string()));
        }

        Ok(Self {
            id: claims.sub,
            username: claims.username,
        })
    }
}

/// Query parameters for uploads
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: String,
    #[serde(default)]
    pub folder: String,
}

/// Query parameters for the image list
#[derive(Debug, Deserialize)]
pub struct ImageListQuery {
    /// Only images created strictly before this instant
    pub cursor: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ImageListResponse {
    pub images: Vec<Image>,
    pub has_more: bool,
    pub next_cursor: Option<DateTime<Utc>>,
}

/// Query parameters for the folder list
#[derive(Debug, Deserialize)]
pub struct FolderListQuery {
    /// Only folders named strictly after this one
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct FolderListResponse {
    pub folders: Vec<Folder>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MoveImageBody {
    pub new_folder: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/auth/register", post(register))
        .route("/api/v1/auth/verify", get(verify_email))
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/images", post(upload_image).get(list_images))
        .route("/api/v1/images/:image_id", get(get_image).delete(delete_image))
        .route("/api/v1/images/:image_id/move", post(move_image))
        .route("/api/v1/folders", get(list_folders))
        .route("/api/v1/folders/:folder_id", delete(delete_folder))
        .route("/api/v1/folders/:folder_id/images", get(list_folder_images))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "photos-storage"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.metadata_store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip_all)]
async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let user = state.accounts.register(request).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip_all)]
async fn verify_email(
    State(state): State<AppState>,
    Query(params): Query<VerifyQuery>,
) -> ApiResult<impl IntoResponse> {
    state.accounts.verify(&params.token).await?;
    Ok(Json(serde_json::json!({ "status": "verified" })))
}

#[instrument(skip_all)]
async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let token = state.accounts.login(request).await?;
    Ok(Json(TokenResponse { token }))
}

/// Stream the request body into the chunk receiver, one record per frame
#[instrument(skip(state, user, body), fields(user_id = %user.id))]
async fn upload_image(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<UploadQuery>,
    body: Body,
) -> ApiResult<(StatusCode, Json<Image>)> {
    let AuthUser { id, username } = user;
    let UploadQuery { filename, folder } = params;

    let mut header = Some((username, folder, filename));
    let records = body.into_data_stream().map(move |frame| {
        frame.map(|chunk| match header.take() {
            Some((username, folder, filename)) => UploadChunk {
                username,
                folder,
                filename,
                chunk,
            },
            None => UploadChunk::data(chunk),
        })
    });

    let image = state.images.upload(id, records).await?;
    Ok((StatusCode::CREATED, Json(image)))
}

#[instrument(skip(state, user))]
async fn list_images(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<ImageListQuery>,
) -> ApiResult<Json<ImageListResponse>> {
    let page = state
        .images
        .list_images(user.id, params.cursor, params.limit)
        .await?;

    let next_cursor = page.next_cursor();
    Ok(Json(ImageListResponse {
        images: page.items,
        has_more: page.has_more,
        next_cursor,
    }))
}

async fn get_image(
    State(state): State<AppState>,
    user: AuthUser,
    Path(image_id): Path<Uuid>,
) -> ApiResult<Json<Image>> {
    Ok(Json(state.images.get_image(user.id, image_id).await?))
}

#[instrument(skip(state, user, body))]
async fn move_image(
    State(state): State<AppState>,
    user: AuthUser,
    Path(image_id): Path<Uuid>,
    Json(body): Json<MoveImageBody>,
) -> ApiResult<Json<MoveOutcome>> {
    let outcome = state
        .images
        .move_image(MoveRequest {
            image_id,
            user_id: user.id,
            new_folder: body.new_folder,
        })
        .await?;

    Ok(Json(outcome))
}

#[instrument(skip(state, user))]
async fn delete_image(
    State(state): State<AppState>,
    user: AuthUser,
    Path(image_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.images.delete_image(user.id, image_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_folders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<FolderListQuery>,
) -> ApiResult<Json<FolderListResponse>> {
    let page = state
        .images
        .list_folders(user.id, params.cursor, params.limit)
        .await?;

    let next_cursor = page.next_cursor();
    Ok(Json(FolderListResponse {
        folders: page.items,
        has_more: page.has_more,
        next_cursor,
    }))
}

async fn list_folder_images(
    State(state): State<AppState>,
    user: AuthUser,
    Path(folder_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Image>>> {
    Ok(Json(
        state.images.list_folder_images(user.id, folder_id).await?,
    ))
}

#[instrument(skip(state, user))]
async fn delete_folder(
    State(state): State<AppState>,
    user: AuthUser,
    Path(folder_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.images.delete_folder(user.id, folder_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Serve the API until `shutdown` resolves, then drain in-flight requests
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting photos API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
