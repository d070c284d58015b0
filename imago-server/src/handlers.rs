//! Request handlers for the admin/API surface over the core engine.

use std::path::PathBuf;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use imago_core::{
    DlqRecoveryReport, ListFilter, PageResult, PositionResult, RebuildMode, RebuildOptions,
    RebuildReport, LibraryScanRequest, RescanOptions,
};
use imago_model::{
    BackgroundJob, CollectionId, CollectionType, JobId, LibraryId, SortDirection, SortField,
};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

fn parse_collection_id(raw: &str) -> AppResult<CollectionId> {
    raw.parse()
        .map_err(|_| AppError::bad_request(format!("invalid collection id `{raw}`")))
}

fn parse_job_id(raw: &str) -> AppResult<JobId> {
    raw.parse()
        .map_err(|_| AppError::bad_request(format!("invalid job id `{raw}`")))
}

fn parse_sort(field: Option<&str>, dir: Option<&str>) -> AppResult<(SortField, SortDirection)> {
    let field = match field {
        None => SortField::UpdatedAt,
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::bad_request(format!("unknown sort field `{raw}`")))?,
    };
    let dir = match dir {
        None => SortDirection::Desc,
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::bad_request(format!("unknown sort direction `{raw}`")))?,
    };
    Ok((field, dir))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerLibraryScanRequest {
    pub library_path: PathBuf,
    #[serde(default = "default_true")]
    pub include_subfolders: bool,
    #[serde(default)]
    pub resume_incomplete: bool,
    #[serde(default)]
    pub overwrite_existing: bool,
    #[serde(default)]
    pub use_direct_file_access: bool,
    #[serde(default = "default_true")]
    pub auto_scan: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreatedResponse {
    pub job_id: JobId,
}

pub async fn trigger_library_scan(
    State(state): State<AppState>,
    Path(library_id): Path<String>,
    Json(request): Json<TriggerLibraryScanRequest>,
) -> AppResult<Json<JobCreatedResponse>> {
    let library_id: LibraryId = library_id
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid library id `{library_id}`")))?;
    let job_id = state
        .orchestrator
        .trigger_library_scan(LibraryScanRequest {
            library_id,
            library_path: request.library_path,
            include_subfolders: request.include_subfolders,
            resume_incomplete: request.resume_incomplete,
            overwrite_existing: request.overwrite_existing,
            use_direct_file_access: request.use_direct_file_access,
            auto_scan: request.auto_scan,
        })
        .await?;
    Ok(Json(JobCreatedResponse { job_id }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRescanRequest {
    pub use_direct_file_access: Option<bool>,
}

pub async fn trigger_collection_rescan(
    State(state): State<AppState>,
    Path(collection_id): Path<String>,
    request: Option<Json<TriggerRescanRequest>>,
) -> AppResult<Json<JobCreatedResponse>> {
    let collection_id = parse_collection_id(&collection_id)?;
    let options = RescanOptions {
        use_direct_file_access: request.and_then(|Json(r)| r.use_direct_file_access),
    };
    let job_id = state
        .orchestrator
        .trigger_collection_rescan(&collection_id, options)
        .await?;
    Ok(Json(JobCreatedResponse { job_id }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: Option<u64>,
    pub page_size: Option<u64>,
    pub sort_field: Option<String>,
    pub sort_dir: Option<String>,
    pub library_id: Option<String>,
    #[serde(rename = "type")]
    pub collection_type: Option<String>,
}

impl ListQuery {
    fn filter(&self) -> AppResult<Option<ListFilter>> {
        if let Some(raw) = &self.library_id {
            let library_id: LibraryId = raw
                .parse()
                .map_err(|_| AppError::bad_request(format!("invalid library id `{raw}`")))?;
            return Ok(Some(ListFilter::Library(library_id)));
        }
        match self.collection_type.as_deref() {
            None => Ok(None),
            Some("folder") => Ok(Some(ListFilter::Type(CollectionType::Folder))),
            Some("archive") => Ok(Some(ListFilter::Type(CollectionType::Archive))),
            Some(other) => Err(AppError::bad_request(format!(
                "unknown collection type `{other}`"
            ))),
        }
    }
}

pub async fn list_collections(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<PageResult>> {
    let (field, dir) = parse_sort(query.sort_field.as_deref(), query.sort_dir.as_deref())?;
    let filter = query.filter()?;
    let page = state
        .index()
        .get_page(
            field,
            dir,
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(20),
            filter.as_ref(),
        )
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionQuery {
    pub sort_field: Option<String>,
    pub sort_dir: Option<String>,
}

pub async fn collection_position(
    State(state): State<AppState>,
    Path(collection_id): Path<String>,
    Query(query): Query<PositionQuery>,
) -> AppResult<Json<PositionResult>> {
    let collection_id = parse_collection_id(&collection_id)?;
    let (field, dir) = parse_sort(query.sort_field.as_deref(), query.sort_dir.as_deref())?;
    let position = state
        .index()
        .get_position(&collection_id, field, dir, None)
        .await?;
    Ok(Json(position))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiblingsQuery {
    pub sort_field: Option<String>,
    pub sort_dir: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<u64>,
}

/// Sidebar listing: page 1 is centered on the open collection.
pub async fn collection_siblings(
    State(state): State<AppState>,
    Path(collection_id): Path<String>,
    Query(query): Query<SiblingsQuery>,
) -> AppResult<Json<PageResult>> {
    let collection_id = parse_collection_id(&collection_id)?;
    let (field, dir) = parse_sort(query.sort_field.as_deref(), query.sort_dir.as_deref())?;
    let page = state
        .index()
        .get_sidebar_page(
            &collection_id,
            field,
            dir,
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(20),
        )
        .await?;
    Ok(Json(page))
}

pub async fn list_jobs(State(state): State<AppState>) -> AppResult<Json<Vec<BackgroundJob>>> {
    let jobs = state.deps.jobs.list_active().await?;
    Ok(Json(jobs))
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<BackgroundJob>> {
    let job_id = parse_job_id(&job_id)?;
    let job = state
        .deps
        .jobs
        .get(&job_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("job {job_id}")))?;
    Ok(Json(job))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<StatusCode> {
    let job_id = parse_job_id(&job_id)?;
    state.orchestrator.cancel_job(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildRequest {
    pub mode: RebuildMode,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub skip_thumbnails: bool,
    pub timeout_secs: Option<u64>,
}

pub async fn rebuild_index(
    State(state): State<AppState>,
    Json(request): Json<RebuildRequest>,
) -> AppResult<Json<RebuildReport>> {
    let options = RebuildOptions {
        mode: request.mode,
        dry_run: request.dry_run,
        skip_thumbnails: request.skip_thumbnails,
        timeout: request.timeout_secs.map(Duration::from_secs),
    };
    // Endpoint-scoped token: the rebuild still honors its own timeout.
    let report = state
        .index()
        .rebuild(options, &CancellationToken::new())
        .await?;
    Ok(Json(report))
}

pub async fn recover_dlq(State(state): State<AppState>) -> AppResult<Json<DlqRecoveryReport>> {
    let report = state.dlq.recover().await?;
    Ok(Json(report))
}

pub async fn health(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let store_ok = state.deps.jobs.list_active().await.is_ok();
    let index_ok = state.index().get_count(None).await.is_ok();
    let broker_ok = state
        .deps
        .broker
        .depth(imago_core::broker::DLQ_QUEUE)
        .await
        .is_ok();
    let healthy = store_ok && index_ok && broker_ok;
    Ok(Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "components": {
            "store": store_ok,
            "index": index_ok,
            "broker": broker_ok,
        }
    })))
}
