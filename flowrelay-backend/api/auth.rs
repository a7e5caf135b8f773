use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::AppState;

const ANONYMOUS: &str = "anonymous";

/// The caller a request was authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
}

/// Decides who is calling. Real session verification lives outside this
/// service; implementations only need to map headers to a user.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Option<AuthUser>;
}

/// Shared bearer token. With no token configured every caller is anonymous.
pub struct StaticTokenAuthenticator {
    token: Option<String>,
}

impl StaticTokenAuthenticator {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Option<AuthUser> {
        let Some(expected) = &self.token else {
            return Some(AuthUser {
                id: ANONYMOUS.to_string(),
            });
        };

        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)?;

        if presented == expected {
            let id = headers
                .get("x-user-id")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(ANONYMOUS);
            Some(AuthUser { id: id.to_string() })
        } else {
            None
        }
    }
}

pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    match state.authenticator.authenticate(req.headers()) {
        Some(user) => {
            tracing::Span::current().record("user_id", user.id.as_str());
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        None => {
            tracing::warn!(path = %req.uri().path(), "rejected unauthenticated request");
            (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()
        }
    }
}
