use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use glimmr_export::{
    ExportJobRunner, ExportService, LocalJobQueue, ProgressSweeper, StreamingSerializer,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{config::AppConfig, export, storage};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ExportService>,
}

impl AppState {
    pub fn new(service: Arc<ExportService>) -> Self {
        Self { service }
    }
}

pub fn build_app(state: AppState, cfg: &AppConfig) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    Router::new()
        .merge(export::api_router())
        .merge(export::download_router())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct GlimmrServer {
    addr: SocketAddr,
    app: Router,
    queue: Arc<LocalJobQueue>,
    sweeper: ProgressSweeper,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Connect storage, start export workers and the progress sweeper.
    pub async fn build(self) -> anyhow::Result<GlimmrServer> {
        let settings = Arc::new(self.config.export.clone());

        let reader = storage::create_dataset_reader(&self.config.storage).await?;
        let store = storage::create_progress_store(&self.config.redis, &settings).await;

        let runner = ExportJobRunner::new(
            StreamingSerializer::new(reader.clone(), settings.page_size),
            settings.export_dir.clone(),
            settings.public_base_path.clone(),
        );
        let queue = Arc::new(LocalJobQueue::start(
            runner,
            settings.worker_count,
            settings.queue_capacity,
        ));
        tracing::info!(
            workers = settings.worker_count,
            capacity = settings.queue_capacity,
            export_dir = %settings.export_dir.display(),
            "Export workers started"
        );

        let service = Arc::new(ExportService::new(
            reader,
            store,
            queue.clone(),
            settings.clone(),
        ));
        let sweeper = ProgressSweeper::start(service.clone(), settings.sweep_interval());

        let app = build_app(AppState::new(service), &self.config);

        Ok(GlimmrServer {
            addr: self.addr,
            app,
            queue,
            sweeper,
        })
    }
}

impl GlimmrServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.sweeper.shutdown().await;
        self.queue.shutdown().await;
        tracing::info!("export workers stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
