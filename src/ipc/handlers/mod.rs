pub mod backup;
pub mod plugin;
pub mod server;

use axum::Json;
use serde_json::{json, Value};

/// `{"success": true, ...extra}`
pub(crate) fn ok(extra: Value) -> Json<Value> {
    let mut body = json!({ "success": true });
    if let (Some(map), Value::Object(extra)) = (body.as_object_mut(), extra) {
        map.extend(extra);
    }
    Json(body)
}
