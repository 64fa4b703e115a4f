//! HTTP surface: unlock, enroll-link generation, enrollment and status.

use crate::config::Config;
use crate::engine::{EngineError, EngineHandle, VerifyOutcome};
use crate::store::{self, RefStore, StoreError};
use crate::tokens::EnrollTokens;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use faceunlock_core::recognizer::ARCFACE_MODEL_VERSION;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Shared state behind every handler.
pub struct AppState {
    pub engine: EngineHandle,
    pub store: RwLock<RefStore>,
    pub tokens: EnrollTokens,
    pub threshold: f32,
}

impl AppState {
    pub fn new(engine: EngineHandle, store: RefStore, tokens: EnrollTokens, threshold: f32) -> Self {
        Self {
            engine,
            store: RwLock::new(store),
            tokens,
            threshold,
        }
    }

    /// Readers wait on the async lock while an enrollment is being saved.
    async fn store(&self) -> RwLockReadGuard<'_, RefStore> {
        self.store.read().await
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid image")]
    InvalidImage,
    #[error("no face detected")]
    NoFace,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("invalid name")]
    InvalidName,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("multipart: {0}")]
    Multipart(#[from] MultipartError),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidImage(_) => ApiError::InvalidImage,
            EngineError::NoFaceDetected => ApiError::NoFace,
            e @ (EngineError::Timeout | EngineError::ChannelClosed) => ApiError::Unavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidName(_) => ApiError::InvalidName,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::InvalidImage => (StatusCode::BAD_REQUEST, json!({ "error": "Invalid image" })),
            ApiError::NoFace => (StatusCode::BAD_REQUEST, json!({ "error": "No face detected" })),
            ApiError::InvalidName => (StatusCode::BAD_REQUEST, json!({ "error": "Invalid name" })),
            ApiError::InvalidToken => (
                StatusCode::BAD_REQUEST,
                json!({ "detail": "Invalid or expired token" }),
            ),
            ApiError::MissingField(field) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "detail": format!("missing field: {field}") }),
            ),
            ApiError::Multipart(err) => (err.status(), json!({ "error": err.body_text() })),
            ApiError::Unavailable(msg) => {
                tracing::error!(error = %msg, "engine unavailable");
                (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": "service unavailable" }))
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "internal error" }))
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum UnlockStatus {
    Ok,
    Fail,
}

#[derive(Debug, Serialize)]
pub struct UnlockResponse {
    pub status: UnlockStatus,
    pub user: Option<String>,
    pub score: f32,
}

impl UnlockResponse {
    fn fail(score: f32) -> Self {
        Self {
            status: UnlockStatus::Fail,
            user: None,
            score,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EnrollLinkResponse {
    pub enroll_link: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct EnrolledResponse {
    pub status: &'static str,
    pub name: String,
}

/// Fields collected from a multipart upload; unknown fields are ignored.
#[derive(Default)]
struct UploadForm {
    image: Option<Vec<u8>>,
    name: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().map(str::to_owned);
        match field_name.as_deref() {
            Some("image") => form.image = Some(field.bytes().await?.to_vec()),
            Some("name") => form.name = Some(field.text().await?),
            other => tracing::debug!(field = ?other, "ignoring multipart field"),
        }
    }
    Ok(form)
}

async fn unlock(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<UnlockResponse>, ApiError> {
    let image = read_form(multipart)
        .await?
        .image
        .ok_or(ApiError::MissingField("image"))?;

    let gallery = state.store().await.gallery();
    let outcome = state.engine.verify(image, gallery, state.threshold).await?;

    let response = match outcome {
        VerifyOutcome::NoFace => UnlockResponse::fail(0.0),
        VerifyOutcome::Compared(result) if result.matched => UnlockResponse {
            status: UnlockStatus::Ok,
            user: result.name,
            score: result.similarity,
        },
        VerifyOutcome::Compared(result) => UnlockResponse::fail(result.similarity),
    };

    tracing::info!(
        status = ?response.status,
        user = response.user.as_deref().unwrap_or("-"),
        score = response.score,
        "unlock attempt"
    );
    Ok(Json(response))
}

async fn generate_enroll_link(State(state): State<Arc<AppState>>) -> Json<EnrollLinkResponse> {
    let token = state.tokens.issue();
    Json(EnrollLinkResponse {
        enroll_link: format!("/enroll/{token}"),
        token,
    })
}

async fn enroll(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    multipart: Multipart,
) -> Result<Json<EnrolledResponse>, ApiError> {
    if !state.tokens.is_valid(&token) {
        return Err(ApiError::InvalidToken);
    }

    let form = read_form(multipart).await?;
    let name = form.name.ok_or(ApiError::MissingField("name"))?;
    let image = form.image.ok_or(ApiError::MissingField("image"))?;
    let name = store::validate_name(&name)?.to_string();

    let result = state.engine.enroll(image).await?;

    // Spend the token only now; a concurrent upload with it loses here.
    let issued_at = state.tokens.take(&token).ok_or(ApiError::InvalidToken)?;

    let quality = result.quality;
    let writer = Arc::clone(&state);
    let stored = tokio::task::spawn_blocking(move || {
        writer
            .store
            .blocking_write()
            .enroll(&name, &result.embedding, &result.jpeg)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("store task: {e}")))
    .and_then(|r| r.map_err(ApiError::from));

    match stored {
        Ok(name) => {
            tracing::info!(name = %name, quality, "user enrolled");
            Ok(Json(EnrolledResponse {
                status: "enrolled",
                name,
            }))
        }
        Err(e) => {
            state.tokens.restore(token, issued_at);
            Err(e)
        }
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let enrolled = state.store().await.len();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "enrolled": enrolled,
        "outstanding_tokens": state.tokens.outstanding(),
        "threshold": state.threshold,
        "model_version": ARCFACE_MODEL_VERSION,
    }))
}

/// CORS policy: any origin when none are configured, otherwise the listed ones.
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        tracing::info!("CORS: allowing any origin");
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    tracing::info!(count = allowed.len(), "CORS: restricted origins");

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

/// Build the application router.
pub fn router(state: Arc<AppState>, config: &Config) -> Router {
    let mut app = Router::new()
        .route("/unlock", post(unlock))
        .route("/generate_enroll_link", post(generate_enroll_link))
        .route("/enroll/:token", post(enroll))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .with_state(state);

    if let Some(dir) = &config.static_dir {
        tracing::info!(dir = %dir.display(), "serving static frontend");
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
}
