use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome flag of the backend's unified envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Ok,
    Failed,
}

/// Unified response shape returned for every outbound call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: ApiStatus,
    #[serde(default)]
    pub retcode: i64,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub wording: String,
}

/// Retcode carried by synthesized "duplicate suppressed" envelopes
pub const RETCODE_DUPLICATE: i64 = -2;

impl ApiResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: ApiStatus::Ok,
            retcode: 0,
            data,
            msg: String::new(),
            wording: String::new(),
        }
    }

    pub fn failed(retcode: i64, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            status: ApiStatus::Failed,
            retcode,
            data: serde_json::Value::Null,
            wording: msg.clone(),
            msg,
        }
    }

    pub fn duplicate_suppressed() -> Self {
        Self::failed(RETCODE_DUPLICATE, "duplicate request suppressed")
    }

    /// `status == ok` and `retcode == 0`
    pub fn is_ok(&self) -> bool {
        self.status == ApiStatus::Ok && self.retcode == 0
    }

    pub fn is_duplicate(&self) -> bool {
        self.status == ApiStatus::Failed && self.retcode == RETCODE_DUPLICATE
    }
}

/// Outbound client to the messaging backend.
///
/// The method surface (send message, group management, uploads) lives in
/// implementations; the core only needs a generic verb + arguments call.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Issue `action` with JSON `params`. Transport failures are folded
    /// into a failed envelope rather than returned as errors.
    async fn call(&self, action: &str, params: serde_json::Value) -> ApiResponse;
}
