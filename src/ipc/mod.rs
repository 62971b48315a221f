pub mod handlers;

use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::instance::BackupSchedule;
use crate::patcher::OptimizationSettings;
use crate::supervisor::{ExitKind, State, SupervisorRegistry};

// ─── IPC 요청/응답 타입 ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsoleQuery {
    /// Only lines with a larger id
    pub since: Option<u64>,
    /// Tail length when `since` is absent
    pub lines: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupCreateRequest {
    #[serde(default)]
    pub name: Option<String>,
}

/// PATCH /settings body; absent fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub backup: Option<BackupSchedule>,
    #[serde(default)]
    pub optimizations: Option<OptimizationSettings>,
}

/// PATCH /properties body: key → value (strings, numbers or booleans).
pub type PropertiesPatch = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerListResponse {
    pub servers: Vec<ServerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub status: State,
    pub pid: Option<u32>,
    pub uptime_seconds: u64,
    pub port: u16,
    pub memory_mb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<ExitKind>,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub registry: Arc<SupervisorRegistry>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(registry: Arc<SupervisorRegistry>, listen_addr: &str) -> Self {
        Self {
            registry,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        use handlers::{backup, plugin, server};

        Router::new()
            .route("/api/servers", get(server::list_servers))
            .route("/api/server/:name/status", get(server::get_status))
            .route("/api/server/:name/start", post(server::start_server))
            .route("/api/server/:name/stop", post(server::stop_server))
            .route("/api/server/:name/restart", post(server::restart_server))
            .route("/api/server/:name/command", post(server::send_command))
            .route("/api/server/:name/console", get(server::get_console))
            .route("/api/server/:name/resources", get(server::get_resources))
            .route(
                "/api/server/:name/properties",
                get(server::get_properties).patch(server::patch_properties),
            )
            .route(
                "/api/server/:name/settings",
                get(server::get_settings).patch(server::patch_settings),
            )
            .route(
                "/api/server/:name/backups",
                get(backup::list_backups).post(backup::create_backup),
            )
            .route("/api/server/:name/backups/:backup", delete(backup::delete_backup))
            .route("/api/server/:name/backups/:backup/restore", post(backup::restore_backup))
            .route("/api/server/:name/plugins", get(plugin::list_plugins))
            .route("/api/server/:name/plugins/reload", post(plugin::reload_plugins))
            .route("/api/server/:name/plugins/:plugin", delete(plugin::delete_plugin))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub async fn start(self) -> Result<()> {
        self.start_with_shutdown(CancellationToken::new()).await
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start_with_shutdown(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}
