pub mod handlers;
pub mod request;

use axum::routing::post;
use axum::Router;

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/submit-question-stream", post(handlers::submit_question_stream))
        .route("/submit-question", post(handlers::submit_question))
        .route("/cancel-request", post(handlers::cancel_request))
}
