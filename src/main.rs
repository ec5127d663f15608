use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{signal, sync::mpsc};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer};
use tracing::{error, info, warn};

use pharmacy_checkout as api;
use pharmacy_checkout::services::gateway::PaymentGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(
        event_rx,
        Arc::new(api::events::LoggingNotifier),
    ));

    if cfg.gateway.secret_key.is_empty() {
        warn!("Gateway secret key is empty; gateway payments will be rejected upstream");
    }
    if cfg.gateway.webhook_secret.is_none() {
        warn!("Webhook signature verification disabled (gateway.webhook_secret unset)");
    }
    let gateway: Arc<dyn PaymentGateway> = Arc::new(
        api::services::gateway::HttpPaymentGateway::new(cfg.gateway.clone())
            .context("failed to build gateway client")?,
    );

    // Aggregate app services used by HTTP handlers
    let services =
        api::handlers::AppServices::new(db_arc.clone(), gateway, event_sender, &cfg);

    let app_state = api::AppState {
        db: db_arc,
        config: Arc::new(cfg.clone()),
        services,
    };

    let mut app = api::build_router(app_state).layer(TimeoutLayer::new(Duration::from_secs(30)));
    if !cfg.is_production() {
        info!("Using permissive CORS outside production");
        app = app.layer(CorsLayer::permissive());
    }

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;
    info!("pharmacy-checkout listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
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
    info!("Shutdown signal received");
}
