pub mod auth;
pub mod middleware;
pub mod questions;
mod routes;

use std::sync::Arc;

use axum::Router;

use crate::config::Config;
use crate::relay::session::RelayContext;
use auth::Authenticator;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Connector, cancellation registry and flag store shared by all sessions.
    pub relay: RelayContext,
    pub authenticator: Arc<dyn Authenticator>,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
