//! HTTP server and routes.

mod handlers;
mod state;

pub use state::{Acquisition, AppState};

use crate::error::basic_challenge;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    middleware,
    response::Response,
    routing::get,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let library_routes = Router::new()
        .route("/nav", get(handlers::library_nav))
        .route("/recent", get(handlers::library_recent))
        .route("/search", get(handlers::library_search))
        .route("/opensearch.xml", get(handlers::opensearch))
        .route("/series", get(handlers::series_list))
        .route("/series/{series_id}", get(handlers::series_items))
        .route("/collections", get(handlers::collections_list))
        .route("/collections/{collection_id}", get(handlers::collection_items))
        .route("/authors", get(handlers::authors_list))
        .route("/authors/{author_id}", get(handlers::author_items));

    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/opds", get(handlers::catalog_root))
        .route("/opds/", get(handlers::catalog_root))
        .route("/opds/{library_id}", get(handlers::library_items))
        .nest("/opds/{library_id}", library_routes)
        .route("/download/{item_id}", get(handlers::download))
        .route("/cover/{item_id}", get(handlers::cover))
        .layer(middleware::map_response_with_state(state.clone(), challenge_realm))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Name the configured title as the Basic realm on every 401.
async fn challenge_realm(State(state): State<AppState>, mut response: Response) -> Response {
    if response.status() == StatusCode::UNAUTHORIZED {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            basic_challenge(&state.config.server.title),
        );
    }
    response
}
