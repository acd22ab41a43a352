//! 文件标识编解码：文件 ID、存储文件名、子目录与公开 URL 之间的映射。
//!
//! 没有元数据索引，文件名本身就是唯一的元数据来源：
//! 上传时存储为 `{uuid}{ext}`，扫描时再从文件名反推出 ID 与扩展名。
//! 原始文件名在这一约定下无法恢复，只能退化为 `file{ext}`。

use std::path::Path;
use uuid::Uuid;

use crate::config::MAX_FOLDER_LEN;

/// UUID 形式文件 ID 的长度。
pub const FILE_ID_LEN: usize = 36;

/// 生成新的文件 ID。
pub fn generate_file_id() -> String {
    Uuid::new_v4().to_string()
}

/// 取文件名的扩展名（含点号，保留大小写）；含反斜杠或控制字符的扩展名视为无扩展名。
pub fn extension_of(name: &str) -> String {
    let Some(ext) = Path::new(name).extension().and_then(|ext| ext.to_str()) else {
        return String::new();
    };
    if ext.is_empty() || ext.chars().any(|c| c == '\\' || c.is_control()) {
        return String::new();
    }
    format!(".{ext}")
}

pub fn stored_name(file_id: &str, extension: &str) -> String {
    format!("{file_id}{extension}")
}

/// 清理上传时提交的子目录名：空格转下划线、去除 `..`、截断长度。
pub fn sanitize_folder(raw: &str) -> String {
    let replaced = raw.replace(' ', "_").replace("..", "");
    let truncated: String = replaced.chars().take(MAX_FOLDER_LEN).collect();
    truncated.trim_matches(['/', '\\']).to_string()
}

/// 从存储文件名反推出的标识信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedName {
    pub file_id: String,
    pub original_name: String,
    pub extension: String,
}

/// 反向解码存储文件名。
pub fn decode_stored_name(name: &str) -> DecodedName {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();

    if follows_id_convention(name) {
        return DecodedName {
            file_id: name[..FILE_ID_LEN].to_string(),
            original_name: format!("file{extension}"),
            extension,
        };
    }

    let file_id = name
        .strip_suffix(extension.as_str())
        .unwrap_or(name)
        .to_string();
    DecodedName {
        file_id,
        original_name: name.to_string(),
        extension,
    }
}

/// 第 37 个字符为点号即视为 `{uuid}.{ext}` 约定。
fn follows_id_convention(name: &str) -> bool {
    name.as_bytes().get(FILE_ID_LEN) == Some(&b'.')
}

/// 文件名是否属于给定 ID（等价于 glob `{id}.*`）。
pub fn matches_file_id(name: &str, file_id: &str) -> bool {
    name.strip_prefix(file_id)
        .is_some_and(|rest| rest.starts_with('.'))
}

/// 校验请求中的文件 ID，拒绝任何可能构成路径的值。
pub fn is_valid_file_id(file_id: &str) -> bool {
    !file_id.is_empty()
        && file_id != "."
        && file_id != ".."
        && !file_id.starts_with('.')
        && !file_id.contains(['/', '\\'])
}

/// 以点号开头的条目（包括上传暂存文件）对扫描与查找不可见。
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

pub fn public_url(tenant_id: &str, folder: &str, stored_name: &str) -> String {
    if folder.is_empty() {
        format!("/static/{tenant_id}/{stored_name}")
    } else {
        format!("/static/{tenant_id}/{folder}/{stored_name}")
    }
}

/// 根据扩展名推断 MIME，未知时为 `application/octet-stream`。
pub fn mime_for_extension(extension: &str) -> String {
    mime_guess::from_ext(extension.trim_start_matches('.'))
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";

    #[test]
    fn generated_ids_are_uuid_shaped() {
        let id = generate_file_id();
        assert_eq!(id.len(), FILE_ID_LEN);
        assert!(Uuid::parse_str(&id).is_ok());
        assert_ne!(id, generate_file_id());
    }

    #[test]
    fn extension_keeps_case_and_dot() {
        assert_eq!(extension_of("Report.PDF"), ".PDF");
        assert_eq!(extension_of("archive.tar.gz"), ".gz");
        assert_eq!(extension_of("README"), "");
        assert_eq!(extension_of("x.日本"), ".日本");
        assert_eq!(extension_of("weird.p df"), ".p df");
        assert_eq!(extension_of("evil.a\\b"), "");
        assert_eq!(extension_of("bell.a\u{7}"), "");
        assert_eq!(stored_name(ID, ".PDF"), format!("{ID}.PDF"));
    }

    #[test]
    fn folder_sanitizing_rules() {
        assert_eq!(sanitize_folder("my docs"), "my_docs");
        assert_eq!(sanitize_folder("../../etc"), "etc");
        assert_eq!(sanitize_folder("a..b"), "ab");
        assert_eq!(sanitize_folder(&"x".repeat(80)).len(), MAX_FOLDER_LEN);
        assert_eq!(sanitize_folder("/reports/"), "reports");
        assert_eq!(sanitize_folder(""), "");
    }

    #[test]
    fn decode_uuid_named_file_loses_original_name() {
        let decoded = decode_stored_name(&format!("{ID}.pdf"));
        assert_eq!(decoded.file_id, ID);
        assert_eq!(decoded.original_name, "file.pdf");
        assert_eq!(decoded.extension, ".pdf");
    }

    #[test]
    fn decode_foreign_file_degrades_to_stem() {
        let decoded = decode_stored_name("quarterly.report.xlsx");
        assert_eq!(decoded.file_id, "quarterly.report");
        assert_eq!(decoded.original_name, "quarterly.report.xlsx");
        assert_eq!(decoded.extension, ".xlsx");

        let bare = decode_stored_name("notes");
        assert_eq!(bare.file_id, "notes");
        assert_eq!(bare.extension, "");
    }

    #[test]
    fn file_id_matching_requires_dot_boundary() {
        assert!(matches_file_id(&format!("{ID}.png"), ID));
        assert!(!matches_file_id(&format!("{ID}x.png"), ID));
        assert!(!matches_file_id(ID, ID));
    }

    #[test]
    fn file_id_validation_rejects_paths() {
        assert!(is_valid_file_id(ID));
        assert!(!is_valid_file_id(""));
        assert!(!is_valid_file_id(".."));
        assert!(!is_valid_file_id("a/b"));
        assert!(!is_valid_file_id("a\\b"));
    }

    #[test]
    fn public_url_includes_folder_when_present() {
        assert_eq!(public_url("shared", "", "a.txt"), "/static/shared/a.txt");
        assert_eq!(
            public_url("shared", "docs", "a.txt"),
            "/static/shared/docs/a.txt"
        );
    }

    #[test]
    fn mime_from_extension_defaults_to_octet_stream() {
        assert_eq!(mime_for_extension(".png"), "image/png");
        assert_eq!(mime_for_extension(".PDF"), "application/pdf");
        assert_eq!(mime_for_extension(""), "application/octet-stream");
        assert_eq!(mime_for_extension(".nope"), "application/octet-stream");
    }
}
