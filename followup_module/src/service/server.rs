use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tokio::task;
use tower_http::cors::CorsLayer;
use tracing::info;

use ai_module::GenerationClient;
use mail_module::MailClient;

use crate::crm_store::SqliteCrmStore;
use crate::engine::core::FollowUpEngine;
use crate::task_queue::SqliteTaskQueue;

use super::config::ServiceConfig;
use super::scheduler::start_scheduler_threads;
use super::state::AppState;
use super::{analytics, clients, cron, emails, follow_ups, replies, BoxError};

pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let config = Arc::new(config);

    let store = {
        let path = config.crm_db_path.clone();
        Arc::new(
            task::spawn_blocking(move || SqliteCrmStore::new(path))
                .await
                .map_err(|err| -> BoxError { err.into() })??,
        )
    };
    let queue = {
        let path = config.queue_db_path.clone();
        let lease = config.queue_lease_secs;
        let attempts = config.queue_max_attempts;
        Arc::new(
            task::spawn_blocking(move || SqliteTaskQueue::with_policy(path, lease, attempts))
                .await
                .map_err(|err| -> BoxError { err.into() })??,
        )
    };

    let generator = Arc::new(GenerationClient::from_env()?);
    let mailer = Arc::new(MailClient::from_env()?);
    let engine = Arc::new(FollowUpEngine::new(
        store.clone(),
        generator,
        mailer.clone(),
        config.follow_up_threshold_days,
    ));

    let mut scheduler_control =
        start_scheduler_threads(config.clone(), store.clone(), queue.clone(), engine.clone());

    let state = AppState {
        config: config.clone(),
        store,
        queue,
        engine,
        mailer,
    };

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    info!("follow-up service listening on {}", addr);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    scheduler_control.stop_and_join();
    serve_result?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/cron", get(cron::trigger))
        .route("/emails", get(emails::list).post(emails::compose))
        .route(
            "/clients",
            get(clients::list)
                .post(clients::create)
                .patch(clients::update)
                .delete(clients::remove),
        )
        .route(
            "/follow-ups",
            get(follow_ups::list)
                .post(follow_ups::create)
                .put(follow_ups::send),
        )
        .route("/replies", post(replies::ingest))
        .route("/analytics/:type", get(analytics::counts))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
