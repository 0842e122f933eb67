use anyhow::{Context, Result};
use axum::{routing::get, Router};
use env360::encryption::{AesGcmEncryptor, Encryptor};
use env360::k8s::RealGatewayFactory;
use env360::settings::Settings;
use env360::store::postgres::PostgresStore;
use env360::store::Store;
use env360::workflow::deploy::DeployWorkflow;
use env360::workflow::dispatch::Dispatcher;
use env360::workflow::subdomain::SubdomainWorkflow;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load().context("failed to load settings")?;

    let store = PostgresStore::connect(&settings.database.url, settings.database.max_connections)
        .await
        .context("failed to connect to database")?;
    store.migrate().await.context("failed to run migrations")?;
    let store: Arc<dyn Store> = Arc::new(store);

    let encryptor: Arc<dyn Encryptor> = match &settings.security.secrets_encryption_key {
        Some(key) => Arc::new(AesGcmEncryptor::new(key).context("invalid secrets_encryption_key")?),
        None => anyhow::bail!("security.secrets_encryption_key is required"),
    };
    let gateway_factory = Arc::new(RealGatewayFactory { encryptor });

    let mut dispatcher = Dispatcher::new(store.clone(), settings.workflow.default_queue_name.clone(), settings.workflow.queue_capacity);
    dispatcher.register(Arc::new(DeployWorkflow::new(
        store.clone(),
        gateway_factory.clone(),
        settings.domain.clone(),
        Duration::from_secs(settings.workflow.deploy_poll_timeout_secs),
        Duration::from_secs(settings.workflow.deploy_poll_interval_secs),
    )));
    dispatcher.register(Arc::new(SubdomainWorkflow::new(
        store.clone(),
        gateway_factory,
        settings.domain.clone(),
    )));
    let dispatcher = Arc::new(dispatcher);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let dispatch_interval = Duration::from_secs(settings.workflow.dispatch_interval_secs);
    let dispatcher_handle = tokio::spawn(dispatcher.clone().run(dispatch_interval, shutdown_rx));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(store.clone())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("HTTP server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    let _ = shutdown_tx.send(true);
    let _ = dispatcher_handle.await;
    info!("shutdown complete");

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(axum::extract::State(store): axum::extract::State<Arc<dyn Store>>) -> Result<&'static str, axum::http::StatusCode> {
    store
        .list_enqueued_workflows("__readyz_probe__", 1)
        .await
        .map(|_| "ok")
        .map_err(|_| axum::http::StatusCode::SERVICE_UNAVAILABLE)
}

/// Waits for SIGTERM or SIGINT, grounded on the teacher's
/// `server::shutdown_signal`.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down gracefully"),
        _ = terminate => info!("received SIGTERM, shutting down gracefully"),
    }
}
