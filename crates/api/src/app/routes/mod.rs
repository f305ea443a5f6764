use axum::Router;

pub mod channels;
pub mod store;
pub mod system;

/// Router for every admin endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/store", store::router())
        .nest("/channels", channels::router())
}
