use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use hyper::header;
use hyper::StatusCode;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use super::questions::handlers::SESSION_KEY_HEADER;
use super::{auth, middleware, questions};
use super::AppState;

pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new().route(
        "/",
        get(|| async {
            Json(json!({
                "status": "ok",
            }))
        }),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers(vec![SESSION_KEY_HEADER]);

    let question_routes = questions::router().route_layer(axum::middleware::from_fn_with_state(
        state.clone(),
        auth::require_auth,
    ));

    Router::new()
        .nest("/health", health_routes)
        .merge(question_routes)
        .fallback(not_found)
        .with_state(state)
        .layer(cors)
        .layer(axum::middleware::from_fn(middleware::strip_trailing_slash))
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}
