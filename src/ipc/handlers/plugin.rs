use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use super::super::IPCServer;
use super::ok;
use crate::supervisor::SupervisorError;

/// GET /api/server/:name/plugins
pub async fn list_plugins(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    let plugins = sup.list_plugins()?;
    Ok(Json(json!({ "plugins": plugins })))
}

/// DELETE /api/server/:name/plugins/:plugin
pub async fn delete_plugin(
    Path((name, plugin)): Path<(String, String)>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    sup.delete_plugin(&plugin)?;
    Ok(ok(json!({ "deleted": plugin })))
}

/// POST /api/server/:name/plugins/reload
pub async fn reload_plugins(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    if !sup.is_running() {
        let body = json!({ "success": false, "error": format!("Server '{}' is not running", name) });
        return Ok((StatusCode::CONFLICT, Json(body)));
    }
    let sent = sup.reload_plugins().await;
    Ok((StatusCode::OK, Json(json!({ "success": sent }))))
}
