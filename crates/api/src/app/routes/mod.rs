use axum::Router;

pub mod import;
pub mod system;

/// Router for the import control surface.
pub fn router() -> Router {
    Router::new().nest("/import", import::router())
}
