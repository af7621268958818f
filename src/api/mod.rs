//! HTTP boundary: multipart endpoints over the similarity pipeline

#[cfg(feature = "web")]
pub(crate) mod handlers;
#[cfg(feature = "web")]
pub(crate) mod responses;

#[cfg(feature = "web")]
use axum::{
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Json, Router,
};
#[cfg(feature = "web")]
use std::sync::Arc;
#[cfg(feature = "web")]
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    services::ServeFile,
    trace::TraceLayer,
};

#[cfg(feature = "web")]
use crate::{error::Result, state::AppState};

#[cfg(feature = "web")]
pub(crate) use handlers::*;
#[cfg(feature = "web")]
pub use responses::HealthResponse;

#[cfg(feature = "web")]
/// Create the application router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let max_upload_size = state.config.max_upload_size;

    Router::new()
        .route_service("/", ServeFile::new(&state.config.index_html))
        .route("/health", get(health_check))
        .route("/upload_image", post(upload_image))
        .route("/search_image", post(search_image))
        .route("/form", post(submit_form))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_size))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(feature = "web")]
/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>> {
    let records = state.pipeline.store().count().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: crate::built_info::PKG_VERSION,
        records,
    }))
}

#[cfg(all(test, feature = "web"))]
mod tests {
    use super::*;
    use crate::core::embeddings::ThumbnailExtractor;
    use crate::core::store::MemoryStore;
    use crate::state::{Config, MEMORY_STORE_URL};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn app() -> Router {
        let config = Config {
            database_url: MEMORY_STORE_URL.to_string(),
            ..Config::default()
        };
        let state = AppState::with_components(
            config,
            Arc::new(ThumbnailExtractor::default()),
            Arc::new(MemoryStore::new()),
        );
        create_router(state)
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let response = app()
            .oneshot(Request::builder().uri("/no_such_route").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_requires_multipart() {
        let request = Request::builder()
            .method("POST")
            .uri("/upload_image")
            .body(Body::from("image=cat"))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }
}
