use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use super::super::{
    CommandRequest, ConsoleQuery, IPCServer, PropertiesPatch, ServerInfo, ServerListResponse, SettingsPatch,
};
use super::ok;
use crate::process_monitor;
use crate::supervisor::console::VISIBLE_LINES;
use crate::supervisor::SupervisorError;

/// GET /api/servers - 인스턴스 디렉토리 목록 + 실행 상태
pub async fn list_servers(State(state): State<IPCServer>) -> Result<Json<ServerListResponse>, SupervisorError> {
    let mut servers = Vec::new();
    for name in state.registry.list()? {
        let sup = match state.registry.get(&name).await {
            Ok(sup) => sup,
            Err(e) => {
                tracing::warn!("Skipping '{}' in server list: {}", name, e);
                continue;
            }
        };
        servers.push(ServerInfo {
            name: sup.name().to_string(),
            status: sup.state(),
            pid: sup.pid(),
            uptime_seconds: sup.uptime_seconds(),
            port: sup.instance().port(),
            memory_mb: sup.max_ram_mb(),
            last_exit: sup.last_exit(),
        });
    }
    Ok(Json(ServerListResponse { servers }))
}

/// GET /api/server/:name/status - 상태 + 게임 포트 질의 결과
pub async fn get_status(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    let running = sup.is_running();
    let snapshot = sup.refresh_status().await;
    let max_players = if running {
        snapshot.max_players
    } else {
        sup.instance().max_players_from_properties()
    };

    Ok(Json(json!({
        "name": sup.name(),
        "status": sup.state(),
        "running": running,
        "pid": sup.pid(),
        "uptime_seconds": sup.uptime_seconds(),
        "last_exit": sup.last_exit(),
        "players": if running { snapshot.players.clone() } else { Vec::new() },
        "online": if running { snapshot.online } else { 0 },
        "max_players": max_players,
        "version": snapshot.version,
        "motd": snapshot.motd,
        "fresh": snapshot.is_fresh(),
    })))
}

/// POST /api/server/:name/start
pub async fn start_server(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.start(&name).await?;
    Ok(ok(json!({ "pid": sup.pid() })))
}

/// POST /api/server/:name/stop - 실패해도 로컬 상태는 항상 stopped
pub async fn stop_server(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    let outcome = sup.stop().await;
    Ok(Json(json!({
        "success": outcome.is_success(),
        "outcome": outcome,
    })))
}

/// POST /api/server/:name/restart
pub async fn restart_server(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    let success = sup.restart().await;
    Ok(Json(json!({ "success": success, "pid": sup.pid() })))
}

/// POST /api/server/:name/command
pub async fn send_command(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(req): Json<CommandRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    if !sup.is_running() {
        let body = json!({ "success": false, "error": format!("Server '{}' is not running", name) });
        return Ok((StatusCode::CONFLICT, Json(body)));
    }
    let sent = sup.send_command(req.command.trim()).await;
    Ok((StatusCode::OK, Json(json!({ "success": sent }))))
}

/// GET /api/server/:name/console?since=<id>&lines=<n>
pub async fn get_console(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Query(query): Query<ConsoleQuery>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    let console = sup.console();
    let lines = match query.since {
        Some(id) => console.since(id),
        None => console.recent(query.lines.unwrap_or(VISIBLE_LINES)),
    };
    Ok(Json(json!({
        "lines": lines,
        "last_id": console.last_id(),
    })))
}

/// GET /api/server/:name/resources
pub async fn get_resources(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    let sample = sup.resources();
    let max_ram_mb = sup.max_ram_mb();
    let history = sup.resource_history();
    Ok(Json(json!({
        "running": sup.is_running(),
        "cpu_percent": sample.cpu_percent,
        "cpu_normalized": sample.cpu_normalized(process_monitor::logical_cores()),
        "ram_mb": sample.ram_mb,
        "ram_percent": sample.ram_percent(max_ram_mb),
        "max_ram_mb": max_ram_mb,
        "history": {
            "cpu": history.cpu(),
            "ram": history.ram(),
        },
    })))
}

/// GET /api/server/:name/properties
pub async fn get_properties(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    let props: serde_json::Map<String, Value> = sup
        .instance()
        .read_properties()?
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    Ok(Json(Value::Object(props)))
}

/// PATCH /api/server/:name/properties - 다음 시작부터 적용
pub async fn patch_properties(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(patch): Json<PropertiesPatch>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    let pairs: Vec<(String, String)> = patch
        .into_iter()
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (k, text)
        })
        .collect();
    sup.instance().update_properties(&pairs)?;
    Ok(ok(json!({ "updated": pairs.len(), "running": sup.is_running() })))
}

/// GET /api/server/:name/settings
pub async fn get_settings(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    let config = sup.instance().load_config();
    Ok(Json(json!({
        "memory": config.memory_mb(),
        "backup": config.backup_schedule(),
        "optimizations": sup.instance().optimizations(),
        "java_path": config.java_path,
    })))
}

/// PATCH /api/server/:name/settings
pub async fn patch_settings(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    let instance = sup.instance();
    if let Some(memory) = patch.memory {
        instance.set_memory(memory)?;
    }
    if let Some(schedule) = patch.backup {
        instance.set_backup_schedule(schedule)?;
    }
    if let Some(settings) = patch.optimizations {
        instance.save_optimizations(settings)?;
    }
    Ok(ok(json!({ "restart_required": sup.is_running() })))
}
