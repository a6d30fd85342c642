use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tower_http::cors::{Any, CorsLayer};

use crate::cursor::connector::HttpConnector;
use crate::cursor::{BridgeConfig, CursorBridge};
use crate::db;
use crate::error::ServiceResult;
use crate::handlers;
use crate::ws::{ConnectionManager, ServerEvent};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub ws: Arc<ConnectionManager>,
    pub cursor: Arc<CursorBridge>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/health", get(handlers::health))
        // Tasks
        .route(
            "/api/tasks",
            get(handlers::tasks::list_tasks).post(handlers::tasks::create_task),
        )
        .route(
            "/api/tasks/:id",
            get(handlers::tasks::get_task)
                .patch(handlers::tasks::update_task)
                .put(handlers::tasks::update_task)
                .delete(handlers::tasks::delete_task),
        )
        .route("/api/tasks/:id/start", post(handlers::tasks::start_task))
        .route(
            "/api/tasks/:id/complete",
            post(handlers::tasks::complete_task),
        )
        .route("/api/tasks/:id/fail", post(handlers::tasks::fail_task))
        .route("/api/tasks/:id/retry", post(handlers::tasks::retry_task))
        .route("/api/tasks/:id/cancel", post(handlers::tasks::cancel_task))
        // Messages
        .route(
            "/api/tasks/:id/messages",
            get(handlers::messages::list_messages).post(handlers::messages::create_message),
        )
        .route(
            "/api/tasks/:id/conversation",
            get(handlers::messages::conversation),
        )
        .route(
            "/api/tasks/:id/latest/:sender",
            get(handlers::messages::latest_by_sender),
        )
        .route("/api/tasks/:id/relay", post(handlers::messages::relay))
        .route(
            "/api/tasks/:id/system-message",
            post(handlers::messages::system_message),
        )
        .route("/api/messages/:id", get(handlers::messages::get_message))
        // Cursor command queue
        .route(
            "/api/cursor/commands",
            post(handlers::cursor::submit_command),
        )
        .route(
            "/api/cursor/commands/:id",
            get(handlers::cursor::get_command).delete(handlers::cursor::cancel_command),
        )
        .route(
            "/api/cursor/commands/:id/result",
            post(handlers::cursor::submit_result),
        )
        .route("/api/cursor/health", get(handlers::cursor::queue_health))
        // SSH contexts
        .route(
            "/api/cursor/ssh-contexts",
            get(handlers::cursor::list_ssh_contexts).post(handlers::cursor::register_ssh_context),
        )
        .route(
            "/api/cursor/ssh-contexts/:id",
            get(handlers::cursor::get_ssh_context).delete(handlers::cursor::remove_ssh_context),
        )
        .route(
            "/api/cursor/ssh-contexts/:id/verify",
            post(handlers::cursor::verify_ssh_context),
        )
        // WebSocket
        .route("/ws", get(handlers::ws::ws_upgrade));

    api.fallback(|| async { (StatusCode::NOT_FOUND, "Not found") })
        .layer(cors)
        .with_state(state)
}

pub struct ServerConfig {
    pub port: u16,
    pub db_path: String,
    pub connector_url: String,
    pub connector_timeout_secs: u64,
    pub queue_max_size: usize,
    pub heartbeat_interval_secs: u64,
    pub ws_stale_secs: i64,
}

pub fn build_state(config: &ServerConfig) -> ServiceResult<AppState> {
    let conn = db::init_db(&config.db_path);
    let connector = Arc::new(HttpConnector::new(
        &config.connector_url,
        config.connector_timeout_secs,
    )?);
    let bridge_config = BridgeConfig {
        queue_max_size: config.queue_max_size,
        heartbeat_interval: std::time::Duration::from_secs(config.heartbeat_interval_secs),
        ..BridgeConfig::default()
    };
    Ok(AppState {
        db: Arc::new(Mutex::new(conn)),
        ws: Arc::new(ConnectionManager::new(config.ws_stale_secs)),
        cursor: CursorBridge::new(connector, bridge_config)?,
    })
}

pub async fn run_server(config: ServerConfig) -> ServiceResult<()> {
    let state = build_state(&config)?;

    state.cursor.start();

    // Forward connector state changes to subscribers of the "agents" topic.
    {
        let ws = state.ws.clone();
        let mut status_rx = state.cursor.subscribe_status();
        tokio::spawn(async move {
            while let Ok(connector_state) = status_rx.recv().await {
                ws.broadcast_to_topic(
                    "agents",
                    ServerEvent::AgentStatus {
                        agent: "cursor".to_string(),
                        status: connector_state.as_str().to_string(),
                        details: serde_json::Value::Null,
                    },
                    None,
                );
            }
        });
    }

    // Reap idle websocket connections.
    {
        let ws = state.ws.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                let reaped = ws.reap_stale();
                if !reaped.is_empty() {
                    tracing::info!(count = reaped.len(), "reaped stale websocket connections");
                }
            }
        });
    }

    // Graceful shutdown: stop the bridge, checkpoint WAL on SIGTERM/SIGINT.
    let shutdown_db = state.db.clone();
    let shutdown_bridge = state.cursor.clone();
    let shutdown_signal = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
        shutdown_bridge.stop();
        // Checkpoint WAL before exit to prevent data loss on restart
        let conn = shutdown_db.lock().unwrap();
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            tracing::error!(error = %e, "WAL checkpoint failed");
        }
        tracing::info!("shutting down gracefully");
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .map_err(|e| {
            crate::error::ServiceError::Configuration(format!(
                "failed to bind port {}: {}",
                config.port, e
            ))
        })?;

    tracing::info!(port = config.port, "taskhub listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(|e| crate::error::ServiceError::Internal(e.to_string()))?;
    Ok(())
}
