//! JSend response envelope shared by the bank and the proxy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Payload {
    /// Best-effort human readable reason carried by a `fail` or `error` payload.
    pub fn reason(&self) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        match self.data.as_ref().and_then(|d| d.get("message")) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => self.status.clone(),
        }
    }
}

/// `200 {"status":"success","data":…}`
pub fn success<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "status": "success", "data": data })),
    )
        .into_response()
}

/// `4xx {"status":"fail","data":{"message":…}}`
pub fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "status": "fail", "data": { "message": message.into() } })),
    )
        .into_response()
}

/// `5xx {"status":"error","message":…}`
pub fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "status": "error", "message": message.into() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_prefers_message_then_data() {
        let p: Payload =
            serde_json::from_str(r#"{"status":"fail","data":{"message":"insufficient funds"}}"#)
                .unwrap();
        assert_eq!(p.reason(), "insufficient funds");

        let p: Payload = serde_json::from_str(r#"{"status":"error","message":"boom"}"#).unwrap();
        assert_eq!(p.reason(), "boom");
    }
}
