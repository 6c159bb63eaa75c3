use crate::{
    error::AppError,
    media::MediaKind,
    state::{AppState, CurrentItem},
    store::MetaData,
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Deserialize)]
pub struct IdQuery {
    pub id: i64,
}

#[derive(Deserialize)]
pub struct CheckQuery {
    pub date: Option<i64>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(rename = "type")]
    pub media_type: Option<String>,
    pub c: Option<String>,
    pub f: Option<i64>,
}

pub async fn nop() -> Json<Value> {
    Json(json!({ "result": "ok" }))
}

pub async fn capability(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "cmd": "capability",
        "serverName": state.config.server.name,
        "version": env!("CARGO_PKG_VERSION"),
        "types": ["v", "a", "p"],
        "category": true,
        "rating": true,
        "mark": true,
        "chapter": true,
        "sync": false,
        "acceptRequest": false,
    }))
}

/// Cheap freshness probe: has anything changed since the client's last
/// sync timestamp (milliseconds)?
pub async fn check(State(state): State<AppState>, Query(query): Query<CheckQuery>) -> Json<Value> {
    let last_updated = state.manager.last_updated();
    let update = last_updated > query.date.unwrap_or(0);
    Json(json!({ "update": update, "date": last_updated }))
}

fn item_json(record: &MetaData) -> Value {
    json!({
        "id": record.id,
        "title": record.title,
        "type": MediaKind::from_ext(&record.ext).code().to_string(),
        "category": record.category,
        "size": record.length,
        "date": record.date,
        "duration": record.duration,
        "label": record.label,
        "description": record.description,
        "mark": record.mark,
        "rating": record.rating,
        "flag": record.flag,
    })
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, AppError> {
    let records = match query.f {
        Some(flag) => state.manager.store().get_by_flag(flag).await?,
        None => state.manager.all_files().await?,
    };

    let type_code = query.media_type.as_deref().and_then(|t| t.chars().next());
    let items: Vec<Value> = records
        .iter()
        .filter(|r| type_code.map_or(true, |t| MediaKind::from_ext(&r.ext).code() == t))
        .filter(|r| query.c.as_deref().map_or(true, |c| r.category == c))
        .map(item_json)
        .collect();

    Ok(Json(json!({
        "list": items,
        "date": state.manager.last_updated(),
    })))
}

pub async fn item(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve_record(&state, query.id, &headers, None).await
}

pub async fn video(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve_record(&state, query.id, &headers, Some(MediaKind::Video)).await
}

pub async fn audio(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    serve_record(&state, query.id, &headers, Some(MediaKind::Audio)).await
}

/// Images are always served whole.
pub async fn photo(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> Result<Response, AppError> {
    let record = lookup(&state, query.id, Some(MediaKind::Photo)).await?;
    let file = File::open(Path::new(&record.path)).await.map_err(AppError::Io)?;
    let file_size = file.metadata().await?.len();

    let stream = ReaderStream::with_capacity(file, STREAM_CHUNK);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, crate::media::mime_for(&record.ext))
        .header(header::CONTENT_LENGTH, file_size)
        .body(Body::from_stream(stream))?)
}

pub async fn chapter(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> Result<Json<Value>, AppError> {
    let record = lookup(&state, query.id, None).await?;
    let chapters = state
        .transcoder
        .chapters(Path::new(&record.path))
        .await?;
    Ok(Json(json!({ "id": record.id, "chapters": chapters })))
}

pub async fn get_current(State(state): State<AppState>) -> Json<CurrentItem> {
    Json(state.current.read().await.clone())
}

pub async fn put_current(
    State(state): State<AppState>,
    Json(current): Json<CurrentItem>,
) -> Json<Value> {
    *state.current.write().await = current;
    Json(json!({ "result": "ok" }))
}

pub async fn categories(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let categories = state.manager.store().categories().await?;
    Ok(Json(json!({ "categories": categories })))
}

async fn lookup(
    state: &AppState,
    id: i64,
    expect: Option<MediaKind>,
) -> Result<MetaData, AppError> {
    let record = state
        .manager
        .get_file(id)
        .await?
        .ok_or(AppError::NotFound)?;
    if let Some(kind) = expect {
        if MediaKind::from_ext(&record.ext) != kind {
            return Err(AppError::NotFound);
        }
    }
    Ok(record)
}

/// Stream a record's file, honoring a single `Range: bytes=start-end`
/// header with `206 Partial Content` / `Content-Range`, `416` for
/// unsatisfiable ranges and a plain `200` full body otherwise.
async fn serve_record(
    state: &AppState,
    id: i64,
    headers: &HeaderMap,
    expect: Option<MediaKind>,
) -> Result<Response, AppError> {
    let record = lookup(state, id, expect).await?;

    let mut file = File::open(Path::new(&record.path)).await.map_err(AppError::Io)?;
    // The record's size may lag behind the disk; the file is authoritative.
    let file_size = file.metadata().await?.len();

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, crate::media::mime_for(&record.ext))
        .header(header::ACCEPT_RANGES, "bytes");

    let range = match headers.get(header::RANGE) {
        Some(value) => {
            let range_str = value.to_str().map_err(|_| AppError::InvalidRange)?;
            debug!("range request for id {}: {}", id, range_str);
            if file_size == 0 {
                return Err(AppError::InvalidRange);
            }
            Some(parse_range_header(range_str, file_size)?)
        }
        None => None,
    };

    let (status, start, len) = match range {
        Some((start, end)) => {
            response = response.header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, file_size),
            );
            (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
        }
        None => (StatusCode::OK, 0, file_size),
    };
    response = response.header(header::CONTENT_LENGTH, len);

    file.seek(SeekFrom::Start(start)).await?;
    let stream = ReaderStream::with_capacity(file.take(len), STREAM_CHUNK);
    Ok(response.status(status).body(Body::from_stream(stream))?)
}

/// Parse a `bytes=start-end` header against the file size. Only the
/// first range of a multi-range header is honored.
fn parse_range_header(range_str: &str, file_size: u64) -> Result<(u64, u64), AppError> {
    let range_part = range_str
        .strip_prefix("bytes=")
        .ok_or(AppError::InvalidRange)?;
    let first_range = range_part.split(',').next().ok_or(AppError::InvalidRange)?;

    let (start_str, end_str) = first_range.split_once('-').ok_or(AppError::InvalidRange)?;

    let start = if start_str.is_empty() {
        // Suffix range "-500": the last 500 bytes.
        let suffix_len: u64 = end_str.parse().map_err(|_| AppError::InvalidRange)?;
        if suffix_len == 0 {
            return Err(AppError::InvalidRange);
        }
        file_size.saturating_sub(suffix_len)
    } else {
        start_str.parse().map_err(|_| AppError::InvalidRange)?
    };

    let end = if end_str.is_empty() || start_str.is_empty() {
        file_size - 1
    } else {
        let parsed_end: u64 = end_str.parse().map_err(|_| AppError::InvalidRange)?;
        parsed_end.min(file_size - 1)
    };

    if start > end || start >= file_size {
        return Err(AppError::InvalidRange);
    }
    Ok((start, end))
}
