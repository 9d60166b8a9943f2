use serde_json::json;
use tracing::error;

use crate::error::EngineError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Engine errors surface their specific reason, except storage failures,
/// which log the cause and answer generically.
pub fn engine_err(id: &str, e: EngineError) -> serde_json::Value {
    if let EngineError::Persistence(ref cause) = e {
        error!(error = %cause, "storage failure");
    }
    err(id, e.code(), e.public_message(), None)
}
