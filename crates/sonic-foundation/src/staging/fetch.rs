//! Raw input retrieval: local file, HTTP(S) download or inline base64.
//!
//! Size caps are enforced before any byte is decoded; downloads are streamed
//! and abandoned as soon as they cross the cap.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use reqwest::Client;
use sonic_kernel::error::{StagingError, ValidationError};
use sonic_kernel::job::MediaSource;
use tracing::debug;

fn too_large(what: &'static str, size: u64, limit: u64) -> StagingError {
    ValidationError::TooLarge { what, size, limit }.into()
}

/// Read `source` fully into memory, refusing anything above `limit` bytes.
pub(crate) async fn fetch(
    client: &Client,
    source: &MediaSource,
    what: &'static str,
    limit: u64,
) -> Result<Vec<u8>, StagingError> {
    let bytes = match source {
        MediaSource::Path(path) => {
            let meta = tokio::fs::metadata(path).await.map_err(|e| StagingError::Fetch {
                what,
                reason: format!("{}: {e}", path.display()),
            })?;
            if !meta.is_file() {
                return Err(StagingError::Fetch {
                    what,
                    reason: format!("{} is not a regular file", path.display()),
                });
            }
            if meta.len() > limit {
                return Err(too_large(what, meta.len(), limit));
            }
            tokio::fs::read(path)
                .await
                .map_err(|e| StagingError::io(what, format!("{}: {e}", path.display())))?
        }
        MediaSource::Url(url) => download(client, url, what, limit).await?,
        MediaSource::Base64(payload) => decode_base64(payload, what, limit)?,
    };
    debug!(what, source = source.kind(), bytes = bytes.len(), "Input fetched");
    Ok(bytes)
}

async fn download(
    client: &Client,
    url: &str,
    what: &'static str,
    limit: u64,
) -> Result<Vec<u8>, StagingError> {
    let fetch_err = |reason: String| StagingError::Fetch { what, reason };

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| fetch_err(format!("request to {url} failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(fetch_err(format!("{url} returned HTTP {status}")));
    }
    if let Some(len) = response.content_length() {
        if len > limit {
            return Err(too_large(what, len, limit));
        }
    }

    let mut body = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| fetch_err(format!("failed to read body of {url}: {e}")))?;
        if (body.len() + chunk.len()) as u64 > limit {
            return Err(too_large(what, (body.len() + chunk.len()) as u64, limit));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Decode an inline payload, accepting an optional `data:<mime>;base64,` prefix.
pub(crate) fn decode_base64(
    payload: &str,
    what: &'static str,
    limit: u64,
) -> Result<Vec<u8>, StagingError> {
    let payload = match payload.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(""),
        None => payload,
    };
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();

    let estimated = (compact.len() as u64 / 4) * 3;
    if estimated > limit {
        return Err(too_large(what, estimated, limit));
    }

    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ValidationError::InvalidReference {
            field: what,
            reason: format!("invalid base64: {e}"),
        })?;
    if bytes.is_empty() {
        return Err(ValidationError::InvalidReference {
            field: what,
            reason: "empty base64 payload".to_string(),
        }
        .into());
    }
    Ok(bytes)
}
