//! ETag 计算与 If-None-Match 匹配。

use axum::http::{HeaderMap, header};
use std::fs::Metadata;
use std::time::UNIX_EPOCH;

/// 根据文件大小与修改时间生成弱 ETag。
pub fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    let modified = metadata.modified().ok();
    if let Some(modified) = modified
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("W/\"{}\"", size)
}

/// `If-None-Match` 是否命中当前 ETag（支持 `*` 与逗号分隔列表）。
pub fn if_none_match_hits(headers: &HeaderMap, current_etag: &str) -> bool {
    let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    if value.trim() == "*" {
        return true;
    }
    let current = strip_weak(current_etag);
    value
        .split(',')
        .map(|item| strip_weak(item.trim()))
        .any(|item| item == current)
}

/// 弱比较：忽略 `W/` 前缀。
fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn etag_is_weak_and_stable() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("a.txt");
        std::fs::write(&path, b"abc").expect("write");
        let metadata = std::fs::metadata(&path).expect("metadata");
        let etag = etag_from_metadata(&metadata);
        assert!(etag.starts_with("W/\"3-"));
        assert_eq!(etag, etag_from_metadata(&metadata));
    }

    #[test]
    fn if_none_match_uses_weak_comparison() {
        let mut headers = HeaderMap::new();
        assert!(!if_none_match_hits(&headers, "W/\"3-1-0\""));

        headers.insert(header::IF_NONE_MATCH, "\"x\", \"3-1-0\"".parse().unwrap());
        assert!(if_none_match_hits(&headers, "W/\"3-1-0\""));

        headers.insert(header::IF_NONE_MATCH, "W/\"4-1-0\"".parse().unwrap());
        assert!(!if_none_match_hits(&headers, "W/\"3-1-0\""));

        headers.insert(header::IF_NONE_MATCH, "*".parse().unwrap());
        assert!(if_none_match_hits(&headers, "W/\"3-1-0\""));
    }
}
