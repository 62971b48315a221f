//! Supervisor error taxonomy. Hard errors only: soft failures (stop/kill,
//! command send, status probe) are reported through `StopOutcome`, `bool`
//! and the cached `StatusSnapshot` instead.

use axum::http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("No server jar found in '{0}'")]
    NoJarFound(String),

    #[error("Failed to launch server '{name}': {reason}")]
    SpawnError { name: String, reason: String },

    #[error("Server '{0}' is running; stop it first")]
    ServerRunning(String),

    #[error("Instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("Backup '{0}' not found")]
    BackupNotFound(String),

    #[error("Backup failed: {0}")]
    BackupError(String),

    #[error("Restore failed: {0}")]
    RestoreError(String),

    #[error("Failed to write config '{path}': {reason}")]
    ConfigWrite { path: String, reason: String },

    #[error("Port {0} is already in use")]
    PortInUse(u16),

    #[error("Invalid name: '{0}'")]
    InvalidName(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    pub fn config_write(path: impl AsRef<std::path::Path>, reason: impl std::fmt::Display) -> Self {
        Self::ConfigWrite {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InstanceNotFound(_) | Self::BackupNotFound(_) => StatusCode::NOT_FOUND,
            Self::ServerRunning(_) | Self::PortInUse(_) => StatusCode::CONFLICT,
            Self::NoJarFound(_) | Self::InvalidName(_) => StatusCode::BAD_REQUEST,
            Self::SpawnError { .. }
            | Self::BackupError(_)
            | Self::RestoreError(_)
            | Self::ConfigWrite { .. }
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoJarFound(_) => "NO_JAR_FOUND",
            Self::SpawnError { .. } => "SPAWN_ERROR",
            Self::ServerRunning(_) => "SERVER_RUNNING",
            Self::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            Self::BackupNotFound(_) => "BACKUP_NOT_FOUND",
            Self::BackupError(_) => "BACKUP_ERROR",
            Self::RestoreError(_) => "RESTORE_ERROR",
            Self::ConfigWrite { .. } => "CONFIG_WRITE_ERROR",
            Self::PortInUse(_) => "PORT_IN_USE",
            Self::InvalidName(_) => "INVALID_NAME",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// axum 핸들러에서 SupervisorError를 직접 반환할 수 있도록 IntoResponse 구현
impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
