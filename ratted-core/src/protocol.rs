//! Upload socket protocol: operation vocabulary, envelope type, typed reply projections and constants.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Client -> server: bearer token as `data`.
pub const OP_AUTH: &str = "auth";
/// Client -> server: `{fileName, fileSize}`. Server -> client: post-solution acknowledgment.
pub const OP_START_UPLOAD: &str = "start_upload";
/// Server -> client: `{challenge, difficulty}`.
pub const OP_POW_CHALLENGE: &str = "pow_challenge";
/// Client -> server: `{nonce}`.
pub const OP_POW_SOLUTION: &str = "pow_solution";
/// Server -> client: cumulative progress after each chunk.
pub const OP_REQUEST_NEXT_CHUNK: &str = "request_next_chunk";
/// Server -> client: final result with `uploadLink`.
pub const OP_UPLOAD_COMPLETE: &str = "upload_complete";

/// Default upload host.
pub const DEFAULT_DOMAIN: &str = "ratted.systems";
/// Socket endpoint path; fixed per deployment.
pub const SOCKET_PATH: &str = "/api/v1/discord/socket";
/// Files strictly larger than this (decimal bytes) go through the socket session.
pub const LARGE_FILE_THRESHOLD: u64 = 100_000_000;
/// Chunk size used when the server does not dictate one.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

pub const AUTH_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const CHALLENGE_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const SOLUTION_ACK_TIMEOUT: Duration = Duration::from_millis(10_000);
/// The server paces the client, so chunk acks are awaited without a bound.
pub const CHUNK_ACK_TIMEOUT: Option<Duration> = None;
pub const COMPLETION_TIMEOUT: Duration = Duration::from_millis(30_000);

/// One control-channel message: `{"op": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub op: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(op: impl Into<String>, data: Value) -> Self {
        Self {
            op: op.into(),
            data,
        }
    }

    /// Project a single field out of `data`. Missing fields, non-object data and type
    /// mismatches all yield `None`.
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let value = self.data.as_object()?.get(name)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Deserialize `data` into a reply type. Reply fields go through `lenient`, so a null or
    /// mistyped field defaults on its own; non-object data yields the whole default.
    pub fn data_as<T: DeserializeOwned + Default>(&self) -> T {
        if !self.data.is_object() {
            return T::default();
        }
        serde_json::from_value(self.data.clone()).unwrap_or_default()
    }
}

/// Field deserializer that turns null or a wrongly typed value into the field's default.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Reply to `auth`. Only `success` and `message` are inspected.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AuthReply {
    #[serde(deserialize_with = "lenient")]
    pub success: bool,
    #[serde(deserialize_with = "lenient")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUpload<'a> {
    pub file_name: &'a str,
    pub file_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PowChallenge {
    #[serde(deserialize_with = "lenient")]
    pub challenge: String,
    #[serde(deserialize_with = "lenient")]
    pub difficulty: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PowSolution {
    pub nonce: u64,
}

/// Post-solution acknowledgment (arrives under `start_upload`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadAccepted {
    #[serde(deserialize_with = "lenient")]
    pub success: bool,
    #[serde(deserialize_with = "lenient")]
    pub message: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub one_time_upload_token: String,
    #[serde(deserialize_with = "lenient")]
    pub chunk_size: Option<i64>,
}

/// Server-computed progress carried by `request_next_chunk`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChunkAck {
    #[serde(deserialize_with = "lenient")]
    pub total_received: u64,
    #[serde(deserialize_with = "lenient")]
    pub total_size: u64,
    #[serde(deserialize_with = "lenient")]
    pub percentage: f64,
    #[serde(deserialize_with = "lenient")]
    pub upload_speed_mbps: f64,
    #[serde(deserialize_with = "lenient")]
    pub estimated_time_str: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadComplete {
    #[serde(deserialize_with = "lenient")]
    pub success: bool,
    #[serde(deserialize_with = "lenient")]
    pub message: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub upload_link: String,
}

/// Server message text, or a generic fallback when the server sent none.
pub fn message_or_unknown(message: Option<String>) -> String {
    message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| "Unknown error".to_string())
}
