//! 文件列表、搜索、下载、元数据与删除处理器。

use axum::body::Body as AxumBody;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Extension, Json, Path, Query};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, SeekFrom};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::RequestContext;
use crate::config::{DOWNLOAD_CACHE_CONTROL, MAX_BULK_DELETE};
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, if_none_match_hits};
use crate::http::TOTAL_COUNT_HEADER;
use crate::query::{
    Pagination, SearchCriteria, SearchRequest, SortField, SortOrder, filter_folder, filter_search,
    filter_text, paginate, sort_records,
};
use crate::response::ApiResponse;
use crate::storage::{FileRecord, Storage, StorageError};

/// 删除权限判定。
pub trait DeletePolicy: Send + Sync {
    fn can_delete(&self, user_id: Option<&str>, tenant_id: &str, record: &FileRecord) -> bool;
}

/// 允许任何调用方删除租户内的文件。
#[derive(Debug, Default)]
pub struct AllowAll;

impl DeletePolicy for AllowAll {
    fn can_delete(&self, _user_id: Option<&str>, _tenant_id: &str, _record: &FileRecord) -> bool {
        true
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    filter: Option<String>,
    folder: Option<String>,
    sort: Option<String>,
    order: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BulkDeleteRequest {
    #[serde(default)]
    file_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeletedFile {
    file_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BulkDeleteError {
    file_id: String,
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BulkDeleteResult {
    deleted_files: Vec<String>,
    errors: Vec<BulkDeleteError>,
    total: usize,
    deleted: usize,
    failed: usize,
}

/// 扫描租户目录；请求被取消（future 被丢弃）时遍历随之停止。
async fn scan_tenant(storage: &Storage) -> Result<Vec<FileRecord>, ApiError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    storage.scan(cancel).await.map_err(|err| match err {
        StorageError::Io(err) => ApiError::ScanFailed(err.to_string()),
        other => ApiError::from(other),
    })
}

/// 列出租户文件，支持过滤、排序与分页。
pub async fn list_files(
    Extension(ctx): Extension<RequestContext>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|err| ApiError::ValidationError(err.body_text()))?;
    let pagination = Pagination::from_params(query.offset.as_deref(), query.limit.as_deref());

    let mut records = scan_tenant(&ctx.storage()).await?;
    if let Some(filter) = query.filter.as_deref().filter(|value| !value.is_empty()) {
        records = filter_text(records, filter);
    }
    if let Some(folder) = query.folder.as_deref() {
        records = filter_folder(records, folder);
    }
    sort_records(
        &mut records,
        SortField::parse(query.sort.as_deref()),
        SortOrder::parse(query.order.as_deref()),
    );
    let page = paginate(records, pagination);

    info!(
        tenant = ctx.tenant_id(),
        total = page.total,
        returned = page.items.len(),
        "list files"
    );
    Ok(paged_response(page.items, page.total))
}

/// 结构化搜索。
pub async fn search_files(
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|err| ApiError::ValidationError(err.body_text()))?;
    let criteria = SearchCriteria::from_request(&request)?;

    let records = scan_tenant(&ctx.storage()).await?;
    let mut records = filter_search(records, &criteria);
    sort_records(
        &mut records,
        SortField::parse(request.sort.as_deref()),
        SortOrder::parse(request.order.as_deref()),
    );
    let page = paginate(records, Pagination::new(request.offset, request.limit));

    info!(
        tenant = ctx.tenant_id(),
        query = request.query,
        total = page.total,
        "search files"
    );
    Ok(paged_response(page.items, page.total))
}

fn paged_response(items: Vec<FileRecord>, total: usize) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static(TOTAL_COUNT_HEADER),
        HeaderValue::from(total),
    );
    (headers, JsonResponse(ApiResponse::ok(items).with_count(total))).into_response()
}

/// 下载文件，支持单段 Range 与 If-None-Match。
pub async fn download_file(
    Extension(ctx): Extension<RequestContext>,
    Path(file_id): Path<String>,
    request_headers: HeaderMap,
) -> Result<Response, ApiError> {
    let storage = ctx.storage();
    let target = storage.locate(&file_id).await?;
    let metadata = match fs::metadata(&target).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ApiError::FileNotFound(file_id));
        }
        Err(err) => return Err(ApiError::Internal(err.to_string())),
    };
    let record = storage.record_for(&target, &metadata);
    let file_size = record.size;

    let mut response_headers = HeaderMap::new();
    let etag = etag_from_metadata(&metadata);
    response_headers.insert(header::ETAG, header_value(&etag)?);
    if let Ok(modified) = metadata.modified() {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(DOWNLOAD_CACHE_CONTROL),
    );
    if if_none_match_hits(&request_headers, &etag) {
        debug!(file_id, "download not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    response_headers.insert(header::CONTENT_TYPE, header_value(&record.mime_type)?);
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition(&record.original_name))?,
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let range = parse_range(request_headers.get(header::RANGE), file_size)?;
    let file = File::open(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(file_id, start, end, length, "download range request accepted");
        let mut file = file;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let stream = ReaderStream::new(file.take(length));
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {}-{}/{}", start, end, file_size))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    info!(
        tenant = ctx.tenant_id(),
        file_id,
        size = file_size,
        "download full file"
    );
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 返回文件记录（重新读取文件状态）。
pub async fn get_metadata(
    Extension(ctx): Extension<RequestContext>,
    Path(file_id): Path<String>,
) -> Result<JsonResponse<ApiResponse<FileRecord>>, ApiError> {
    let record = ctx.storage().load_record(&file_id).await?;
    Ok(JsonResponse(ApiResponse::ok(record)))
}

/// 删除单个文件。
pub async fn delete_file(
    Extension(ctx): Extension<RequestContext>,
    Extension(policy): Extension<Arc<dyn DeletePolicy>>,
    Path(file_id): Path<String>,
) -> Result<JsonResponse<ApiResponse<DeletedFile>>, ApiError> {
    delete_one(&ctx, policy.as_ref(), &file_id).await?;
    info!(tenant = ctx.tenant_id(), file_id, "file deleted");
    Ok(JsonResponse(
        ApiResponse::ok(DeletedFile { file_id }).with_message("File deleted successfully"),
    ))
}

/// 批量删除；逐个处理，单个失败不影响其余文件。
pub async fn bulk_delete(
    Extension(ctx): Extension<RequestContext>,
    Extension(policy): Extension<Arc<dyn DeletePolicy>>,
    payload: Result<Json<BulkDeleteRequest>, JsonRejection>,
) -> Result<JsonResponse<ApiResponse<BulkDeleteResult>>, ApiError> {
    let Json(request) = payload.map_err(|err| ApiError::ValidationError(err.body_text()))?;
    if request.file_ids.is_empty() {
        return Err(ApiError::ValidationError("fileIds must not be empty".into()));
    }
    if request.file_ids.len() > MAX_BULK_DELETE {
        return Err(ApiError::ValidationError(format!(
            "at most {MAX_BULK_DELETE} files per request"
        )));
    }

    let total = request.file_ids.len();
    let mut deleted_files = Vec::new();
    let mut errors = Vec::new();
    for file_id in request.file_ids {
        match delete_one(&ctx, policy.as_ref(), &file_id).await {
            Ok(()) => deleted_files.push(file_id),
            Err(err) => errors.push(BulkDeleteError {
                file_id,
                error: err.to_string(),
            }),
        }
    }

    if errors.is_empty() {
        info!(tenant = ctx.tenant_id(), total, "bulk delete");
    } else {
        warn!(
            tenant = ctx.tenant_id(),
            total,
            failed = errors.len(),
            "bulk delete finished with errors"
        );
    }
    let deleted = deleted_files.len();
    let failed = errors.len();
    Ok(JsonResponse(ApiResponse::ok(BulkDeleteResult {
        deleted_files,
        errors,
        total,
        deleted,
        failed,
    })))
}

async fn delete_one(
    ctx: &RequestContext,
    policy: &dyn DeletePolicy,
    file_id: &str,
) -> Result<(), ApiError> {
    let storage = ctx.storage();
    let record = storage.load_record(file_id).await?;
    if !policy.can_delete(ctx.user_id.as_deref(), ctx.tenant_id(), &record) {
        return Err(ApiError::PermissionDenied(file_id.to_string()));
    }
    storage.remove(&record).await?;
    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("failed to build header".into()))
}

/// 文件名中的引号与非 ASCII 字符替换为 `_`。
fn content_disposition(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

/// 解析 Range 头：仅取第一段，起点缺省为 0，终点缺省为文件末尾。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let not_satisfiable = || ApiError::RangeNotSatisfiable(file_size);
    let value = value.to_str().map_err(|_| not_satisfiable())?;
    let Some(ranges) = value.strip_prefix("bytes=") else {
        return Err(not_satisfiable());
    };
    let first = ranges.split(',').next().unwrap_or_default().trim();
    let Some((start_part, end_part)) = first.split_once('-') else {
        return Err(not_satisfiable());
    };

    let start: u64 = if start_part.is_empty() {
        0
    } else {
        start_part.parse().map_err(|_| not_satisfiable())?
    };
    let end: u64 = if end_part.is_empty() {
        match file_size.checked_sub(1) {
            Some(last) => last,
            None => return Err(not_satisfiable()),
        }
    } else {
        end_part.parse().map_err(|_| not_satisfiable())?
    };

    if start > end || end >= file_size {
        return Err(not_satisfiable());
    }
    Ok(Some((start, end)))
}
