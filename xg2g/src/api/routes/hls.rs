//! HLS playlist and segment delivery.

use std::path::Path as FsPath;

use axum::{
    Extension,
    extract::{Path, State},
    http::header::{CACHE_CONTROL, CONTENT_TYPE},
    response::{IntoResponse, Response},
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::middleware::{Principal, Scope};
use crate::api::server::AppState;

/// Content type for a servable HLS file, or `None` if the extension is not
/// served.
pub fn content_type_for(filename: &str) -> Option<&'static str> {
    let ext = FsPath::new(filename).extension()?.to_str()?;
    match ext {
        "m3u8" => Some("application/vnd.apple.mpegurl"),
        "ts" => Some("video/mp2t"),
        "m4s" => Some("video/iso.segment"),
        "mp4" => Some("video/mp4"),
        "vtt" => Some("text/vtt"),
        _ => None,
    }
}

/// File names are a single path component of `[A-Za-z0-9_.-]`.
pub fn is_valid_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.starts_with('.')
        && filename
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

pub async fn serve_hls_file(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, filename)): Path<(String, String)>,
) -> ApiResult<Response> {
    principal.require(Scope::Read)?;

    let content_type = is_valid_filename(&filename)
        .then(|| content_type_for(&filename))
        .flatten()
        .ok_or_else(|| ApiError::bad_request(format!("Invalid HLS file name '{filename}'")))?;

    let session = state
        .store
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("Session with id '{}' not found", id)))?;

    let path = session.output_dir.join(&filename);
    let body = match tokio::fs::read(&path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found(format!(
                "'{filename}' not found for session '{id}'"
            )));
        }
        Err(e) => {
            tracing::warn!(session_id = %id, path = %path.display(), "Failed to read HLS file: {}", e);
            return Err(ApiError::internal("Failed to read HLS file"));
        }
    };

    state.store.touch(&id);

    let cache_control = if filename.ends_with(".m3u8") {
        "no-cache"
    } else {
        "public, max-age=3600"
    };
    Ok((
        [(CONTENT_TYPE, content_type), (CACHE_CONTROL, cache_control)],
        body,
    )
        .into_response())
}
