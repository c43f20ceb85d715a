//! `GET`/`HEAD /<disk-id>[.ext]`: the range-read protocol.
//!
//! Each request is independent. The only gatekeeping is the client's `User-Agent`, which must
//! match the reader token for `GET` and the stat token for `HEAD`; it is checked before the disk
//! is looked up. A disk that is not ready answers exactly like an unknown one.

use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        header::{self, HeaderValue},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
};
use odisk_media::{Disk, DiskError, DiskState};
use tokio_util::io::ReaderStream;

use super::range::{parse_range_header, RangeParseError};
use crate::AppState;

/// `User-Agent` of clients allowed to read disk contents.
pub const READER_USER_AGENT: &str = "CCURLBS::readDataFork";
/// `User-Agent` of clients allowed to stat a disk.
pub const STAT_USER_AGENT: &str = "CCURLBS::statImage";

const SERVER_TOKEN: &str = "ODS/1.0";
const CONTENT_TYPE_DISK: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("client identity rejected")]
    Forbidden,
    #[error("disk not found")]
    NotFound,
    #[error("device not ready")]
    NotReady,
    /// Answered with `500`: clients treat an undecodable range as a server fault.
    #[error("range decode error: {0}")]
    RangeDecode(#[from] RangeParseError),
    #[error("range not satisfiable: {source}")]
    Unsatisfiable {
        size: u64,
        #[source]
        source: DiskError,
    },
    #[error(transparent)]
    Disk(DiskError),
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound | Self::NotReady => StatusCode::NOT_FOUND,
            Self::RangeDecode(_) | Self::Disk(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unsatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }

        let mut response = (status, self.to_string()).into_response();
        insert_common_headers(response.headers_mut());
        if let Self::Unsatisfiable { size, .. } = self {
            if let Ok(value) = HeaderValue::try_from(format!("bytes */{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

pub async fn get_disk(
    Path(segment): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ProtocolError> {
    require_user_agent(&headers, READER_USER_AGENT)?;
    let (disk_id, disk) = resolve_disk(&state, &segment)?;
    ensure_ready(&state, disk.as_ref()).await?;

    let requested = parse_range_header(headers.get(header::RANGE).and_then(|v| v.to_str().ok()))?;

    let (range, reader) = match disk.open_range(requested.start, requested.end).await {
        Ok(opened) => opened,
        Err(err) if err.is_range_error() => {
            let size = disk.size().await.unwrap_or(0);
            return Err(ProtocolError::Unsatisfiable { size, source: err });
        }
        Err(err) => return Err(ProtocolError::Disk(err)),
    };
    let size = disk.size().await.map_err(ProtocolError::Disk)?;
    state.metrics.observe_bytes_served(disk_id, range.len());

    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    insert_common_headers(headers);
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_DISK));
    // Echo the range as requested (an open end stays `0`), not as resolved.
    headers.insert(
        header::CONTENT_RANGE,
        header_value(format!("bytes {}-{}/{size}", requested.start, requested.end))?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(range.len()));
    Ok(response)
}

pub async fn head_disk(
    Path(segment): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ProtocolError> {
    require_user_agent(&headers, STAT_USER_AGENT)?;
    let (_, disk) = resolve_disk(&state, &segment)?;
    ensure_ready(&state, disk.as_ref()).await?;
    let size = disk.size().await.map_err(ProtocolError::Disk)?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    insert_common_headers(headers);
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_DISK));
    headers.insert(
        header::DATE,
        header_value(httpdate::fmt_http_date(SystemTime::now()))?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    Ok(response)
}

fn require_user_agent(headers: &HeaderMap, expected: &str) -> Result<(), ProtocolError> {
    let agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    if agent == Some(expected) {
        return Ok(());
    }
    tracing::debug!(user_agent = ?agent, expected, "unexpected client");
    Err(ProtocolError::Forbidden)
}

/// Resolve a path segment such as `disk0.iso` against the current snapshot.
fn resolve_disk<'a>(
    state: &AppState,
    segment: &'a str,
) -> Result<(&'a str, Arc<dyn Disk>), ProtocolError> {
    let disk_id = disk_id_from_segment(segment);
    tracing::Span::current().record("disk_id", disk_id);
    let disk = state
        .registry
        .snapshot()
        .get(disk_id)
        .ok_or(ProtocolError::NotFound)?;
    Ok((disk_id, disk))
}

/// Strip the directory part and the last extension: `disk0.iso` → `disk0`.
///
/// A leading dot does not start an extension, so `.disk0` stays as is.
pub(crate) fn disk_id_from_segment(segment: &str) -> &str {
    let base = segment.rsplit('/').next().unwrap_or(segment);
    match base.rfind('.') {
        Some(dot) if dot > 0 => &base[..dot],
        _ => base,
    }
}

async fn ensure_ready(state: &AppState, disk: &dyn Disk) -> Result<(), ProtocolError> {
    match disk.state().await {
        Ok(DiskState::Ready) => Ok(()),
        Ok(disk_state) => {
            tracing::debug!(filename = %disk.filename().display(), state = %disk_state, "device not ready");
            Err(ProtocolError::NotReady)
        }
        Err(err) => {
            tracing::warn!(filename = %disk.filename().display(), error = %err, "device query failed");
            state.metrics.observe_device_query_failure();
            Err(ProtocolError::NotReady)
        }
    }
}

fn insert_common_headers(headers: &mut HeaderMap) {
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_TOKEN));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
}

fn header_value(value: String) -> Result<HeaderValue, ProtocolError> {
    HeaderValue::try_from(value).map_err(|err| {
        ProtocolError::Disk(DiskError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err,
        )))
    })
}
