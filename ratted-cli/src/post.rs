//! Small-file upload: one multipart POST.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use ratted_core::EndpointConfig;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

const POST_TIMEOUT: Duration = Duration::from_secs(30);

/// Server reply to a POST upload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ApiReply {
    pub success: bool,
    pub message: Option<String>,
    pub resource: Option<String>,
    pub thumbnail: Option<String>,
}

/// Upload `path` as form field `file`. Returns the reply only when the server reports success.
pub async fn upload_file(
    endpoint: &EndpointConfig,
    token: &str,
    path: &Path,
) -> anyhow::Result<ApiReply> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let part = Part::bytes(bytes)
        .file_name(file_name)
        .mime_str("application/octet-stream")?;
    let form = Form::new().part("file", part);

    let client = reqwest::Client::builder()
        .timeout(POST_TIMEOUT)
        .user_agent(endpoint.user_agent.clone())
        .build()?;
    let body = client
        .post(endpoint.post_url())
        .header(AUTHORIZATION, token)
        .multipart(form)
        .send()
        .await
        .context("sending upload request")?
        .text()
        .await?;
    let reply = parse_reply(&body)?;
    if !reply.success {
        bail!(
            "file upload failed: {}",
            ratted_core::protocol::message_or_unknown(reply.message)
        );
    }
    Ok(reply)
}

fn parse_reply(body: &str) -> anyhow::Result<ApiReply> {
    serde_json::from_str(body).context("failed to parse API response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_with_thumbnail() {
        let r = parse_reply(
            r#"{"success":true,"resource":"https://ratted.systems/u/a","thumbnail":"https://ratted.systems/t/a"}"#,
        )
        .unwrap();
        assert!(r.success);
        assert_eq!(r.resource.as_deref(), Some("https://ratted.systems/u/a"));
        assert_eq!(r.thumbnail.as_deref(), Some("https://ratted.systems/t/a"));
    }

    #[test]
    fn reply_missing_fields_defaults() {
        let r = parse_reply(r#"{"message":"quota exceeded"}"#).unwrap();
        assert!(!r.success);
        assert_eq!(r.resource, None);
    }

    #[test]
    fn non_json_reply_is_error() {
        assert!(parse_reply("<html>502</html>").is_err());
    }
}
