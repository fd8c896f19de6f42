use std::sync::Arc;

use anyhow::Context;
use tokio::{signal, sync::mpsc};
use tracing::{error, info, warn};

use uniform_procurement as procurement;
use uniform_procurement::{
    directory::{load_seed, Directory, InMemoryDirectory},
    events::{process_events, EventSender},
    logging::{setup_logger, LoggerConfig},
    services::{ServiceContainer, ServiceFactory},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = procurement::config::load_config().context("failed to load configuration")?;
    procurement::config::init_tracing(cfg.log_level(), cfg.log_json);
    procurement::handlers::health::init_start_time();

    // Init DB
    let db_pool = procurement::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;
    if cfg.auto_migrate {
        procurement::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Directory of suppliers, approvers and policies
    let directory = match cfg.directory_seed_path.as_deref() {
        Some(path) => {
            let seed = load_seed(path).with_context(|| format!("failed to load directory seed {path}"))?;
            InMemoryDirectory::from_seed(seed)
        }
        None => {
            warn!("No directory seed configured; starting with an empty directory");
            InMemoryDirectory::new()
        }
    };
    let directory = Directory::in_memory(Arc::new(directory));

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(EventSender::new(event_tx));
    tokio::spawn(process_events(event_rx));

    // Build services
    let factory = ServiceFactory::new(db_arc.clone(), directory, Some(event_sender));
    let services = ServiceContainer::new(&factory);
    let app_state = AppState::new(db_arc, cfg.clone(), services);

    let logger = setup_logger(LoggerConfig::default());
    let app = procurement::app_router(app_state, logger);

    // Bind and serve
    let addr = cfg.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("uniform-procurement listening on http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
