//! Route configuration and setup

use axum::{
    http::{HeaderName, HeaderValue, Method},
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use stowage_core::Config;
use stowage_storage::signing::LOCAL_STORAGE_ROUTE;

use crate::api_doc::ApiDoc;
use crate::constants::{API_PREFIX, BODY_LIMIT_SLACK_BYTES, IDENTITY_HEADER};
use crate::handlers;
use crate::state::AppState;

/// Setup all application routes
pub fn setup_routes(config: &Config, state: Arc<AppState>) -> Result<Router<()>, anyhow::Error> {
    let cors = setup_cors(config)?;

    let workspace_routes = Router::new()
        .route("/", post(handlers::workspaces::create_workspace))
        .route(
            "/{workspace_id}",
            get(handlers::workspaces::get_workspace)
                .delete(handlers::workspaces::delete_workspace),
        )
        .route(
            "/{workspace_id}/uploads",
            post(handlers::uploads::initiate_upload),
        )
        .route(
            "/{workspace_id}/uploads/{upload_id}",
            axum::routing::delete(handlers::uploads::abort_upload),
        )
        .route(
            "/{workspace_id}/uploads/{upload_id}/content",
            put(handlers::upload_content::upload_content),
        )
        .route(
            "/{workspace_id}/uploads/{upload_id}/complete",
            post(handlers::uploads::complete_single_chunk),
        )
        .route(
            "/{workspace_id}/uploads/{upload_id}/finalize",
            post(handlers::uploads::finalize_upload),
        )
        .route(
            "/{workspace_id}/uploads/{upload_id}/parts",
            get(handlers::uploads::list_parts),
        )
        .route(
            "/{workspace_id}/uploads/{upload_id}/parts/{part_number}",
            post(handlers::uploads::initiate_part),
        )
        .route(
            "/{workspace_id}/uploads/{upload_id}/parts/{part_number}/complete",
            post(handlers::uploads::complete_part),
        )
        .route(
            "/{workspace_id}/uploads/{upload_id}/parts/{part_number}/content",
            put(handlers::upload_content::upload_part_content),
        )
        .route("/{workspace_id}/bulk-delete", post(handlers::bulk::bulk_delete))
        .route("/{workspace_id}/bulk-move", post(handlers::bulk::bulk_move))
        .route("/{workspace_id}/size-count", post(handlers::bulk::size_count));

    let storage_routes = Router::new()
        .route(
            "/",
            get(handlers::storages::list_storages).post(handlers::storages::create_storage),
        )
        .route(
            "/{storage_id}",
            put(handlers::storages::replace_storage).delete(handlers::storages::delete_storage),
        );

    let api_routes = Router::new()
        .nest("/workspaces", workspace_routes)
        .nest("/storages", storage_routes)
        .route(
            "/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        );

    let local_storage_routes = Router::new().route(
        "/{bucket}/{*key}",
        get(handlers::local_storage::signed_get).put(handlers::local_storage::signed_put),
    );

    let app = Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest(LOCAL_STORAGE_ROUTE, local_storage_routes)
        .nest(API_PREFIX, api_routes)
        .layer(RequestBodyLimitLayer::new(max_body_bytes(config)))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(app)
}

/// Largest body the service accepts: a brokered single-chunk upload or one part.
fn max_body_bytes(config: &Config) -> usize {
    let thresholds = config.upload_thresholds;
    let largest = thresholds
        .single_chunk_max_bytes
        .max(thresholds.part_size_bytes);
    usize::try_from(largest)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_SLACK_BYTES)
}

fn setup_cors(config: &Config) -> Result<CorsLayer, anyhow::Error> {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let cors = if config.cors_origins.iter().any(|origin| origin == "*") {
        if config.is_production() {
            tracing::warn!("CORS configured to allow all origins - not recommended for production");
        }
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any)
    } else {
        let origins = config
            .cors_origins
            .iter()
            .map(|origin| origin.parse::<HeaderValue>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Invalid CORS origin: {}", e))?;

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::CONTENT_LENGTH,
                HeaderName::from_static(IDENTITY_HEADER),
            ])
            .expose_headers([axum::http::header::ETAG])
    };
    Ok(cors)
}
