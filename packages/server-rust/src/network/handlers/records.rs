//! `/api/v1/kv` record endpoints.

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use kvstore_core::{
    CreateRecordRequest, DeleteMode, DeleteRecordRequest, KvError, Page, PageRequest, Record,
    UpdateRecordRequest,
};
use serde::Deserialize;

use super::AppState;
use crate::network::error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

/// Raw pagination query; validated by [`PageRequest::parse`] so that bad
/// values produce our error body rather than an extractor rejection.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    limit: Option<String>,
    offset: Option<String>,
}

impl PageQuery {
    fn parse(&self) -> ApiResult<PageRequest> {
        Ok(PageRequest::parse(
            self.limit.as_deref(),
            self.offset.as_deref(),
        )?)
    }
}

/// `POST /api/v1/kv`
pub async fn create_record(
    State(state): State<AppState>,
    body: Result<Json<CreateRecordRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Record>)> {
    let Json(req) = body?;
    let record = state.records.create(&req.key, &req.value).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `GET /api/v1/kv/{key}`
pub async fn get_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Record>> {
    Ok(Json(state.records.get(&key).await?))
}

/// `PUT /api/v1/kv/{key}`
pub async fn update_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Result<Json<UpdateRecordRequest>, JsonRejection>,
) -> ApiResult<Json<Record>> {
    let Json(req) = body?;
    Ok(Json(state.records.update(&key, &req.value).await?))
}

/// `DELETE /api/v1/kv/{key}`
///
/// The body is optional: empty means a soft delete, otherwise
/// `{"soft_delete": false}` selects the hard delete.
pub async fn delete_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Record>> {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        DeleteRecordRequest::default()
    } else {
        serde_json::from_slice::<DeleteRecordRequest>(&body)
            .map_err(|err| ApiError::MalformedBody(err.to_string()))?
    };
    let record = match req.mode() {
        DeleteMode::Soft => state.records.soft_delete(&key).await?,
        DeleteMode::Hard => state.records.delete(&key).await?,
    };
    Ok(Json(record))
}

/// `GET | PUT | DELETE /api/v1/kv/`: the key segment is empty, which the
/// `{key}` routes never match.
pub async fn empty_key() -> ApiError {
    KvError::InvalidKey.into()
}

/// `POST /api/v1/kv/{key}/restore`
pub async fn restore_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Record>> {
    Ok(Json(state.records.restore(&key).await?))
}

/// `GET /api/v1/kv`
pub async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Page<Record>>> {
    let page = query.parse()?;
    Ok(Json(state.records.list(page).await?))
}

/// `GET /api/v1/kv/all`
pub async fn list_all_records(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Page<Record>>> {
    let page = query.parse()?;
    Ok(Json(state.records.list_including_deleted(page).await?))
}
