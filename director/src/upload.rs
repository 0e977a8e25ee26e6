//! Object-storage uploader (§6): resolves inlined base64 prediction outputs
//! to S3-compatible object URLs.
//!
//! Invoked by the webhook emitter (C7) only for `SUCCEEDED` terminal
//! responses. Per-item failures fall back to the original data URL rather
//! than raising (spec §4.7): a broken upload must never block webhook
//! delivery.

use std::time::{Duration, Instant};

use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct UploadParams {
    pub url: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub url_prefix: String,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub object_key: Option<String>,
}

/// Uploads every data-URL found in `output` (a list of data URLs, or a map
/// of string to list of data URLs), replacing each with an object-storage
/// URL on success. Any other shape is passed through unchanged (Open
/// Question (b), resolved in SPEC_FULL.md). Returns the rewritten output and
/// the total elapsed time, which the caller records as
/// `response.metrics["upload_time"]`.
pub async fn upload_output(
    params: &UploadParams,
    output: serde_json::Value,
) -> (serde_json::Value, Duration) {
    let started = Instant::now();
    let client = build_client(params).await;

    let rewritten = match output {
        serde_json::Value::Array(items) => {
            let mut uploaded = Vec::with_capacity(items.len());
            for item in items {
                uploaded.push(upload_item(&client, params, item).await);
            }
            serde_json::Value::Array(uploaded)
        }
        serde_json::Value::Object(map) => {
            let mut uploaded = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                let new_value = match value {
                    serde_json::Value::Array(items) => {
                        let mut out = Vec::with_capacity(items.len());
                        for item in items {
                            out.push(upload_item(&client, params, item).await);
                        }
                        serde_json::Value::Array(out)
                    }
                    other => other,
                };
                uploaded.insert(key, new_value);
            }
            serde_json::Value::Object(uploaded)
        }
        other => other,
    };

    (rewritten, started.elapsed())
}

async fn build_client(params: &UploadParams) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &params.access_key,
        &params.secret_key,
        None,
        None,
        "director-upload",
    );
    let config = aws_sdk_s3::Config::builder()
        .endpoint_url(&params.url)
        .credentials_provider(credentials)
        .region(aws_sdk_s3::config::Region::new("us-east-1"))
        .force_path_style(true)
        .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
        .build();
    aws_sdk_s3::Client::from_conf(config)
}

async fn upload_item(
    client: &aws_sdk_s3::Client,
    params: &UploadParams,
    item: serde_json::Value,
) -> serde_json::Value {
    let serde_json::Value::String(data_url) = &item else {
        return item;
    };

    match try_upload(client, params, data_url).await {
        Ok(url) => serde_json::Value::String(url),
        Err(err) => {
            tracing::warn!(error = %err, "upload failed for item, forwarding original data URL");
            item
        }
    }
}

async fn try_upload(
    client: &aws_sdk_s3::Client,
    params: &UploadParams,
    data_url: &str,
) -> Result<String, UploadError> {
    let (mime, bytes) = decode_data_url(data_url)?;
    let digest = format!("{:x}", md5::compute(&bytes));
    let ext = extension_for_mime(&mime);

    let object_key = match &params.object_key {
        Some(key) => key.clone(),
        None => format!("{digest}{ext}"),
    };
    let key = match &params.path_prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), object_key),
        None => object_key.clone(),
    };

    client
        .put_object()
        .bucket(&params.bucket)
        .key(&key)
        .body(ByteStream::from(bytes))
        .content_type(mime)
        .send()
        .await
        .map_err(|err| UploadError::PutObject(err.to_string()))?;

    Ok(format!("{}/{}", params.url_prefix.trim_end_matches('/'), key))
}

fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>), UploadError> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or(UploadError::NotADataUrl)?;
    let (header, payload) = rest.split_once(',').ok_or(UploadError::NotADataUrl)?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or(UploadError::NotADataUrl)?
        .to_string();
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, payload)
        .map_err(|err| UploadError::Base64(err.to_string()))?;
    Ok((mime, bytes))
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "audio/mpeg" => ".mp3",
        "audio/wav" | "audio/x-wav" => ".wav",
        "video/mp4" => ".mp4",
        "application/json" => ".json",
        "text/plain" => ".txt",
        _ => "",
    }
}

#[derive(Debug, thiserror::Error)]
enum UploadError {
    #[error("value is not a data URL")]
    NotADataUrl,
    #[error("base64 decode failed: {0}")]
    Base64(String),
    #[error("put_object failed: {0}")]
    PutObject(String),
}
