use std::sync::Arc;

use archivist_jobs::JobScheduler;
use archivist_lifecycle::ExpirationSweeper;
use archivist_storage::ObjectLayer;
use axum::{
    Router,
    routing::{delete, get},
};
use tower_http::trace::TraceLayer;

use crate::{gateway::ArchiveGateway, handlers, signer::LinkSigner};

pub struct AppState {
    pub gateway: Arc<ArchiveGateway>,
    pub scheduler: JobScheduler,
    pub object_layer: Arc<dyn ObjectLayer>,
    pub bucket: String,
    pub signer: LinkSigner,
    pub sweeper: Arc<ExpirationSweeper>,
}

pub fn archive_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/archive/{dataset_id}",
            get(handlers::archive::get_archive).post(handlers::archive::create_archive),
        )
        .route("/jobs", get(handlers::jobs::list_jobs))
        .route("/jobs/{job_id}", get(handlers::jobs::get_job))
        .route("/objects/{*key}", get(handlers::objects::download_object))
        .route("/health", get(handlers::health::health))
        .route("/admin/dead-letters", get(handlers::admin::list_dead_letters))
        .route(
            "/admin/dead-letters/{dataset_id}",
            delete(handlers::admin::clear_dead_letter),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
