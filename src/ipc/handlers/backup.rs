use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use super::super::{BackupCreateRequest, IPCServer};
use super::ok;
use crate::supervisor::SupervisorError;

/// GET /api/server/:name/backups - 최신순
pub async fn list_backups(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    let backups = sup.backups().list()?;
    Ok(Json(json!({ "backups": backups })))
}

/// POST /api/server/:name/backups - 이름 생략 시 backup_YYYYmmdd_HHMMSS
pub async fn create_backup(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    body: Option<Json<BackupCreateRequest>>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let info = sup.backups().create(req.name.as_deref()).await?;
    Ok(ok(json!({ "backup": info })))
}

/// POST /api/server/:name/backups/:backup/restore - 서버가 꺼져 있어야 함
pub async fn restore_backup(
    Path((name, backup)): Path<(String, String)>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    sup.backups().restore(&backup).await?;
    Ok(ok(json!({ "restored": backup })))
}

/// DELETE /api/server/:name/backups/:backup
pub async fn delete_backup(
    Path((name, backup)): Path<(String, String)>,
    State(state): State<IPCServer>,
) -> Result<Json<Value>, SupervisorError> {
    let sup = state.registry.get(&name).await?;
    sup.backups().delete(&backup).await?;
    Ok(ok(json!({ "deleted": backup })))
}
