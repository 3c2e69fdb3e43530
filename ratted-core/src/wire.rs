//! Framing: JSON text frames for envelopes, raw binary frames for the upload header and chunk data.

use serde::Serialize;

use crate::protocol::Envelope;

/// Hash field sent in the upload header. Content hashing is not performed.
pub const UNHASHED_PLACEHOLDER: &str = "no";

const HEADER_PREFIX: &str = "FILEUPLOAD_";
const HEADER_SEPARATOR: &str = "||";
const HEADER_SUFFIX: &str = ">>";

#[derive(Serialize)]
struct OutgoingEnvelope<'a, T: Serialize> {
    op: &'a str,
    data: &'a T,
}

/// Encode an operation into the text payload of one frame.
pub fn encode_envelope<T: Serialize>(op: &str, data: &T) -> Result<String, EncodeError> {
    serde_json::to_string(&OutgoingEnvelope { op, data }).map_err(EncodeError::Json)
}

/// Error encoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode the text payload of one frame. Anything that is not an object with a string `op` is rejected.
pub fn decode_envelope(text: &str) -> Result<Envelope, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if !value.get("op").map(|op| op.is_string()).unwrap_or(false) {
        return Err(DecodeError::MissingOp);
    }
    Ok(serde_json::from_value(value)?)
}

/// Error decoding an envelope (bad JSON or no `op`).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope has no op")]
    MissingOp,
}

/// Upload-initiation header sent as a binary frame before the first chunk:
/// `FILEUPLOAD_{token}||{hash}>>`.
pub fn upload_header(one_time_token: &str, file_hash: &str) -> Vec<u8> {
    format!("{HEADER_PREFIX}{one_time_token}{HEADER_SEPARATOR}{file_hash}{HEADER_SUFFIX}").into_bytes()
}
