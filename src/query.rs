//! 查询管线：文本过滤、目录过滤、结构化搜索、排序与分页。
//!
//! 所有步骤作用于一次完整扫描得到的记录列表，顺序固定：
//! filter -> folder -> search -> sort -> paginate。总数取分页之前的数量。

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Deserialize;
use std::cmp::Ordering;

use crate::codec::mime_for_extension;
use crate::config::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use crate::error::ApiError;
use crate::storage::FileRecord;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortField {
    Name,
    Size,
    Extension,
    #[default]
    UploadedAt,
}

impl SortField {
    /// 未知取值回退到上传时间。
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("name") => SortField::Name,
            Some("size") => SortField::Size,
            Some("extension") => SortField::Extension,
            _ => SortField::UploadedAt,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(order) if order.trim().eq_ignore_ascii_case("asc") => SortOrder::Asc,
            _ => SortOrder::Desc,
        }
    }
}

/// 分页参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Pagination {
    /// 超出 (0, MAX_PAGE_LIMIT] 的 limit 重置为默认值。
    pub fn new(offset: Option<usize>, limit: Option<usize>) -> Self {
        let limit = match limit {
            Some(limit) if limit > 0 && limit <= MAX_PAGE_LIMIT => limit,
            _ => DEFAULT_PAGE_LIMIT,
        };
        Self {
            offset: offset.unwrap_or(0),
            limit,
        }
    }

    /// 从查询字符串解析，非数字按缺省处理。
    pub fn from_params(offset: Option<&str>, limit: Option<&str>) -> Self {
        let parse = |value: Option<&str>| value.and_then(|v| v.trim().parse::<usize>().ok());
        Self::new(parse(offset), parse(limit))
    }
}

/// 一页结果与过滤后的总数。
#[derive(Debug)]
pub struct Page {
    pub items: Vec<FileRecord>,
    pub total: usize,
}

/// 结构化搜索请求体。
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub types: Vec<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// 校验后的搜索条件。
#[derive(Debug)]
pub struct SearchCriteria {
    query: String,
    types: Vec<String>,
    min_size: Option<u64>,
    max_size: Option<u64>,
    uploaded_from: Option<DateTime<Utc>>,
    uploaded_until: Option<DateTime<Utc>>,
}

impl SearchCriteria {
    pub fn from_request(request: &SearchRequest) -> Result<Self, ApiError> {
        if request.query.is_empty() {
            return Err(ApiError::EmptyQuery);
        }
        let uploaded_from = request
            .date_from
            .as_deref()
            .filter(|value| !value.is_empty())
            .map(start_of_day)
            .transpose()?;
        // 结束日期整天包含在内。
        let uploaded_until = request
            .date_to
            .as_deref()
            .filter(|value| !value.is_empty())
            .map(|value| {
                start_of_day(value)?
                    .checked_add_days(Days::new(1))
                    .ok_or_else(|| ApiError::ValidationError(format!("invalid date: {value}")))
            })
            .transpose()?;

        Ok(Self {
            query: request.query.to_lowercase(),
            types: request.types.clone(),
            min_size: request.min_size.filter(|size| *size > 0),
            max_size: request.max_size.filter(|size| *size > 0),
            uploaded_from,
            uploaded_until,
        })
    }

    pub fn matches(&self, record: &FileRecord) -> bool {
        if !matches_text(record, &self.query) {
            return false;
        }
        if !self.types.is_empty() && !type_allowed(&record.extension, &self.types) {
            return false;
        }
        if self.min_size.is_some_and(|min| record.size < min) {
            return false;
        }
        if self.max_size.is_some_and(|max| record.size > max) {
            return false;
        }
        if self
            .uploaded_from
            .is_some_and(|from| record.uploaded_at < from)
        {
            return false;
        }
        if self
            .uploaded_until
            .is_some_and(|until| record.uploaded_at > until)
        {
            return false;
        }
        true
    }
}

fn start_of_day(value: &str) -> Result<DateTime<Utc>, ApiError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ApiError::ValidationError(format!("invalid date: {value}")))
}

/// 原始名、存储名或扩展名包含子串（不区分大小写）。`needle` 须已转小写。
fn matches_text(record: &FileRecord, needle: &str) -> bool {
    record.original_name.to_lowercase().contains(needle)
        || record.file_name.to_lowercase().contains(needle)
        || record.extension.to_lowercase().contains(needle)
}

pub fn filter_text(records: Vec<FileRecord>, filter: &str) -> Vec<FileRecord> {
    let needle = filter.to_lowercase();
    records
        .into_iter()
        .filter(|record| matches_text(record, &needle))
        .collect()
}

/// 精确匹配子目录；空字符串表示只保留根目录文件。
pub fn filter_folder(records: Vec<FileRecord>, folder: &str) -> Vec<FileRecord> {
    records
        .into_iter()
        .filter(|record| record.folder == folder)
        .collect()
}

pub fn filter_search(records: Vec<FileRecord>, criteria: &SearchCriteria) -> Vec<FileRecord> {
    records
        .into_iter()
        .filter(|record| criteria.matches(record))
        .collect()
}

/// 类型匹配：`*`/`*/*` 任意；含 `/` 的按 MIME 精确或 `type/*` 前缀匹配；其余按扩展名匹配。
pub fn type_allowed(extension: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let extension = extension.to_ascii_lowercase();
    let mime = mime_for_extension(&extension);

    allowed.iter().any(|pattern| {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern == "*" || pattern == "*/*" {
            return true;
        }
        if pattern.contains('/') {
            return match pattern.strip_suffix("/*") {
                Some(prefix) => mime
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/')),
                None => pattern == mime,
            };
        }
        !extension.is_empty()
            && (pattern == extension || pattern == extension.trim_start_matches('.'))
    })
}

/// 稳定排序，相等元素保持扫描顺序。
pub fn sort_records(records: &mut [FileRecord], field: SortField, order: SortOrder) {
    records.sort_by(|a, b| {
        let ordering = compare(a, b, field);
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

fn compare(a: &FileRecord, b: &FileRecord, field: SortField) -> Ordering {
    match field {
        SortField::Name => a.original_name.cmp(&b.original_name),
        SortField::Size => a.size.cmp(&b.size),
        SortField::Extension => a.extension.cmp(&b.extension),
        SortField::UploadedAt => a.uploaded_at.cmp(&b.uploaded_at),
    }
}

/// 偏移量越界时返回空页而非错误。
pub fn paginate(records: Vec<FileRecord>, pagination: Pagination) -> Page {
    let total = records.len();
    let items = records
        .into_iter()
        .skip(pagination.offset)
        .take(pagination.limit)
        .collect();
    Page { items, total }
}
