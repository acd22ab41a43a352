//! multipart 上传：类型与大小校验、边写边算哈希、暂存后原子落盘。

use axum::body::Body as AxumBody;
use axum::extract::multipart::MultipartError;
use axum::extract::{Extension, FromRequest, Multipart, Request};
use axum::http::{StatusCode, header};
use axum::response::Json as JsonResponse;
use chrono::Utc;
use http_body_util::{LengthLimitError, Limited};
use sha2::{Digest, Sha256};
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::atomic::{StagedFile, is_staged_name};
use crate::auth::RequestContext;
use crate::codec::{extension_of, generate_file_id, sanitize_folder, stored_name};
use crate::error::ApiError;
use crate::query::type_allowed;
use crate::response::ApiResponse;
use crate::storage::{FileRecord, Storage};
use crate::tenant::{TenantPolicy, TenantRegistry};

/// 请求体中除文件内容外的 multipart 边界与字段开销上限。
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

#[derive(Debug)]
pub struct UploadConfig {
    /// 全局上传上限，与租户上限取较小值。
    pub max_file_size: u64,
    /// 暂存文件超过该时长即由后台任务删除，为零时不清理。
    pub temp_ttl: Duration,
}

impl UploadConfig {
    pub fn effective_limit(&self, policy: &TenantPolicy) -> u64 {
        self.max_file_size.min(policy.max_file_size)
    }
}

struct ReceivedFile {
    staged: StagedFile,
    original_name: String,
    extension: String,
    size: u64,
    hash: String,
}

/// 上传单个文件（字段 `file`，可选字段 `folder`）。
pub async fn upload_file(
    Extension(ctx): Extension<RequestContext>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    request: Request,
) -> Result<(StatusCode, JsonResponse<ApiResponse<FileRecord>>), ApiError> {
    let limit = upload.effective_limit(&ctx.tenant.policy);
    let body_limit = limit.saturating_add(MULTIPART_OVERHEAD);

    if let Some(length) = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        && length > body_limit
    {
        warn!(
            tenant = ctx.tenant_id(),
            content_length = length,
            limit,
            "upload rejected by content length"
        );
        return Err(ApiError::FileTooLarge(limit));
    }

    let (parts, body) = request.into_parts();
    let body = AxumBody::new(Limited::new(
        body,
        usize::try_from(body_limit).unwrap_or(usize::MAX),
    ));
    let mut multipart = Multipart::from_request(Request::from_parts(parts, body), &())
        .await
        .map_err(|err| ApiError::ValidationError(err.body_text()))?;

    let storage = ctx.storage();
    let mut received = None;
    let mut folder_raw = String::new();
    let outcome = read_fields(
        &mut multipart,
        &ctx,
        limit,
        &storage,
        &mut received,
        &mut folder_raw,
    )
    .await;
    let received = match (outcome, received) {
        (Ok(()), Some(received)) => received,
        (Ok(()), None) => return Err(ApiError::ValidationError("no file uploaded".into())),
        (Err(err), received) => {
            if let Some(received) = received {
                received.staged.cleanup().await;
            }
            return Err(err);
        }
    };

    let folder = sanitize_folder(&folder_raw);
    let destination = if folder.is_empty() {
        Ok(storage.root_path().to_path_buf())
    } else {
        storage
            .resolve_folder_checked(&folder)
            .await
            .map_err(ApiError::from)
    };
    let destination = match destination {
        Ok(destination) => destination,
        Err(err) => {
            received.staged.cleanup().await;
            return Err(err);
        }
    };
    if let Err(err) = fs::create_dir_all(&destination).await {
        received.staged.cleanup().await;
        return Err(ApiError::StorageWriteFailed(err.to_string()));
    }

    let file_id = generate_file_id();
    let target = destination.join(stored_name(&file_id, &received.extension));
    received.staged.finalize(&target).await?;

    let metadata = fs::metadata(&target)
        .await
        .map_err(|err| ApiError::StorageWriteFailed(err.to_string()))?;
    let mut record = storage.record_for(&target, &metadata);
    record.original_name = received.original_name;
    record.uploaded_at = Utc::now();
    record.hash = Some(received.hash);

    info!(
        tenant = ctx.tenant_id(),
        file_id = record.file_id,
        folder = record.folder,
        size = received.size,
        "file uploaded"
    );
    Ok((
        StatusCode::CREATED,
        JsonResponse(ApiResponse::ok(record).with_message("File uploaded successfully")),
    ))
}

/// 读取所有字段；文件内容写入暂存文件，暂存文件一旦创建就放入 `received`，
/// 由调用方负责失败时清理。租户根目录在类型校验通过后才创建。
async fn read_fields(
    multipart: &mut Multipart,
    ctx: &RequestContext,
    limit: u64,
    storage: &Storage,
    received: &mut Option<ReceivedFile>,
    folder: &mut String,
) -> Result<(), ApiError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_error(err, limit))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") if received.is_none() => {
                let original_name = field.file_name().unwrap_or_default().to_string();
                let extension = extension_of(&original_name);
                if !type_allowed(&extension, &ctx.tenant.policy.allowed_types) {
                    return Err(ApiError::UnsupportedType(if extension.is_empty() {
                        original_name
                    } else {
                        extension
                    }));
                }

                storage
                    .ensure_root()
                    .await
                    .map_err(|err| ApiError::StorageWriteFailed(err.to_string()))?;
                let staged = StagedFile::new(storage.root_path()).await?;
                let slot = received.insert(ReceivedFile {
                    staged,
                    original_name,
                    extension,
                    size: 0,
                    hash: String::new(),
                });

                let mut hasher = Sha256::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|err| multipart_error(err, limit))?
                {
                    slot.size += chunk.len() as u64;
                    if slot.size > limit {
                        warn!(tenant = ctx.tenant_id(), limit, "upload exceeds size limit");
                        return Err(ApiError::FileTooLarge(limit));
                    }
                    hasher.update(&chunk);
                    slot.staged
                        .file_mut()
                        .write_all(&chunk)
                        .await
                        .map_err(|err| ApiError::StorageWriteFailed(err.to_string()))?;
                }
                slot.staged
                    .file_mut()
                    .flush()
                    .await
                    .map_err(|err| ApiError::StorageWriteFailed(err.to_string()))?;
                slot.hash = format!("{:x}", hasher.finalize());
                debug!(bytes = slot.size, "upload stream complete");
            }
            Some("folder") => {
                *folder = field
                    .text()
                    .await
                    .map_err(|err| multipart_error(err, limit))?;
            }
            _ => continue,
        }
    }
    Ok(())
}

fn multipart_error(err: MultipartError, limit: u64) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE || exceeds_body_limit(&err) {
        ApiError::FileTooLarge(limit)
    } else {
        ApiError::ValidationError(err.body_text())
    }
}

/// `Limited` 的超限错误可能被多层 body 包装，沿 `source()` 链查找。
fn exceeds_body_limit(err: &MultipartError) -> bool {
    let mut current = Some(err as &(dyn StdError + 'static));
    while let Some(err) = current {
        if err.is::<LengthLimitError>() {
            return true;
        }
        current = err.source();
    }
    false
}

/// 删除各租户根目录下超过 `temp_ttl` 的上传暂存文件，返回删除数量。
pub async fn cleanup_upload_temp(
    registry: &TenantRegistry,
    upload: &UploadConfig,
) -> Result<usize, io::Error> {
    if upload.temp_ttl.is_zero() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    for tenant_id in registry.list_all() {
        let Some(tenant) = registry.lookup(&tenant_id) else {
            continue;
        };
        let storage = Storage::for_tenant(tenant);
        let mut dir = match fs::read_dir(storage.root_path()).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_name().to_str().is_some_and(is_staged_name) {
                continue;
            }
            // 并发上传可能刚好完成重命名
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Some(age) = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
            else {
                continue;
            };
            if age >= upload.temp_ttl {
                let path = entry.path();
                if let Err(err) = fs::remove_file(&path).await {
                    warn!(
                        tenant = tenant_id,
                        path = ?path,
                        error = %err,
                        "failed to remove stale upload temp file"
                    );
                } else {
                    info!(tenant = tenant_id, path = ?path, "removed stale upload temp file");
                    removed += 1;
                }
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::{Tenant, TenantPolicy, builtin_policies};
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;
    use tokio_util::io::ReaderStream;

    const BOUNDARY: &str = "tenant-file-server-boundary";

    struct Part<'a> {
        name: &'a str,
        file_name: Option<&'a str>,
        data: &'a [u8],
    }

    fn multipart_request(parts: &[Part<'_>]) -> Request {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part.file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        part.name, file_name
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        part.name
                    )
                    .as_bytes(),
                ),
            }
            body.extend_from_slice(part.data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/files/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from(body))
            .expect("request")
    }

    fn make_ctx(root: PathBuf, max_file_size: u64, allowed_types: &[&str]) -> RequestContext {
        RequestContext {
            tenant: Tenant {
                id: "shared".to_string(),
                policy: Arc::new(TenantPolicy {
                    max_file_size,
                    allowed_types: allowed_types.iter().map(|s| s.to_string()).collect(),
                    storage_root: PathBuf::from("shared"),
                    requires_auth: false,
                    compression_enabled: false,
                    description: String::new(),
                }),
                root,
            },
            user_id: None,
        }
    }

    fn upload_config(max_file_size: u64) -> Extension<Arc<UploadConfig>> {
        Extension(Arc::new(UploadConfig {
            max_file_size,
            temp_ttl: Duration::from_secs(60),
        }))
    }

    fn staged_leftovers(root: &Path) -> Vec<String> {
        std::fs::read_dir(root)
            .map(|dir| {
                dir.filter_map(Result::ok)
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .filter(|name| is_staged_name(name))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn stored_files(root: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect()
    }

    #[tokio::test]
    async fn upload_stores_file_and_reports_hash() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("shared");
        let data = b"hello tenant file server";
        let request = multipart_request(&[
            Part {
                name: "folder",
                file_name: None,
                data: b"my reports",
            },
            Part {
                name: "file",
                file_name: Some("Report.TXT"),
                data,
            },
        ]);

        let (status, JsonResponse(body)) = upload_file(
            Extension(make_ctx(root.clone(), 1024, &["*/*"])),
            upload_config(1024),
            request,
        )
        .await
        .unwrap_or_else(|err| panic!("upload failed: {err}"));

        assert_eq!(status, StatusCode::CREATED);
        let record = body.data;
        assert_eq!(record.original_name, "Report.TXT");
        assert_eq!(record.extension, ".TXT");
        assert_eq!(record.folder, "my_reports");
        assert_eq!(record.size, data.len() as u64);
        assert_eq!(
            record.hash.as_deref(),
            Some(format!("{:x}", Sha256::digest(data)).as_str())
        );
        assert_eq!(record.file_name, format!("{}.TXT", record.file_id));

        let stored = root.join("my_reports").join(&record.file_name);
        assert_eq!(std::fs::read(stored).expect("read stored"), data);
        assert_eq!(stored_files(&root).len(), 1);
    }

    #[tokio::test]
    async fn oversized_upload_leaves_no_file() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("shared");
        let data = vec![7u8; 4096];
        let request = multipart_request(&[Part {
            name: "file",
            file_name: Some("big.bin"),
            data: &data,
        }]);

        let result = upload_file(
            Extension(make_ctx(root.clone(), 1024, &["*/*"])),
            upload_config(10 * 1024),
            request,
        )
        .await;

        assert!(matches!(result, Err(ApiError::FileTooLarge(1024))));
        assert!(stored_files(&root).is_empty());
    }

    #[tokio::test]
    async fn unsupported_type_is_rejected_before_writing() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("shared");
        let request = multipart_request(&[Part {
            name: "file",
            file_name: Some("manual.pdf"),
            data: b"%PDF",
        }]);

        let result = upload_file(
            Extension(make_ctx(root.clone(), 1024, &["image/*"])),
            upload_config(1024),
            request,
        )
        .await;

        assert!(matches!(result, Err(ApiError::UnsupportedType(_))));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn content_length_over_limit_is_rejected_up_front() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("shared");
        let mut request = multipart_request(&[Part {
            name: "file",
            file_name: Some("small.bin"),
            data: b"ab",
        }]);
        request
            .headers_mut()
            .insert(header::CONTENT_LENGTH, (10 * 1024 * 1024u64).into());

        let result = upload_file(
            Extension(make_ctx(root.clone(), 1024, &["*/*"])),
            upload_config(10 * 1024),
            request,
        )
        .await;

        assert!(matches!(result, Err(ApiError::FileTooLarge(1024))));
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn body_over_transport_limit_is_file_too_large() {
        let large = vec![b'x'; 200 * 1024];
        for field in ["note", "folder"] {
            let temp = tempdir().expect("tempdir");
            let root = temp.path().join("shared");
            let request = multipart_request(&[
                Part {
                    name: field,
                    file_name: None,
                    data: &large,
                },
                Part {
                    name: "file",
                    file_name: Some("tiny.bin"),
                    data: b"ab",
                },
            ]);
            assert!(request.headers().get(header::CONTENT_LENGTH).is_none());

            let result = upload_file(
                Extension(make_ctx(root.clone(), 1024, &["*/*"])),
                upload_config(10 * 1024),
                request,
            )
            .await;

            assert!(
                matches!(result, Err(ApiError::FileTooLarge(1024))),
                "{field}: {:?}",
                result.err()
            );
            assert!(stored_files(&root).is_empty());
        }
    }

    #[tokio::test]
    async fn abandoned_upload_removes_staged_file() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("shared");
        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        writer
            .write_all(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; \
                     filename=\"slow.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            )
            .await
            .expect("write head");
        writer.write_all(&[1u8; 100]).await.expect("write data");

        let request = Request::builder()
            .method("POST")
            .uri("/api/files/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from_stream(ReaderStream::new(reader)))
            .expect("request");

        let mut upload = Box::pin(upload_file(
            Extension(make_ctx(root.clone(), 1024 * 1024, &["*/*"])),
            upload_config(1024 * 1024),
            request,
        ));
        let stalled = tokio::time::timeout(Duration::from_millis(300), upload.as_mut()).await;
        assert!(stalled.is_err());
        assert_eq!(staged_leftovers(&root).len(), 1);

        drop(upload);
        assert!(staged_leftovers(&root).is_empty());
        drop(writer);
    }

    #[tokio::test]
    async fn stale_staged_files_are_swept() {
        let temp = tempdir().expect("tempdir");
        let registry = TenantRegistry::new(temp.path(), builtin_policies()).expect("registry");
        let root = Storage::for_tenant(registry.lookup("shared").expect("shared"))
            .root_path()
            .to_path_buf();
        std::fs::create_dir_all(&root).expect("create root");

        let hours_ago = SystemTime::now() - Duration::from_secs(2 * 60 * 60);
        let stale = root.join(".upload-stale.tmp");
        let fresh = root.join(".upload-fresh.tmp");
        let regular = root.join("0f8fad5b-d9cb-469f-a165-70867728950e.txt");
        for path in [&stale, &fresh, &regular] {
            std::fs::write(path, b"data").expect("write");
        }
        for path in [&stale, &regular] {
            std::fs::File::options()
                .write(true)
                .open(path)
                .expect("open")
                .set_modified(hours_ago)
                .expect("set mtime");
        }

        let config = UploadConfig {
            max_file_size: 1024,
            temp_ttl: Duration::from_secs(60 * 60),
        };
        let removed = cleanup_upload_temp(&registry, &config)
            .await
            .expect("sweep");
        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(regular.exists());

        let disabled = UploadConfig {
            max_file_size: 1024,
            temp_ttl: Duration::ZERO,
        };
        std::fs::write(&stale, b"data").expect("write");
        std::fs::File::options()
            .write(true)
            .open(&stale)
            .expect("open")
            .set_modified(hours_ago)
            .expect("set mtime");
        assert_eq!(
            cleanup_upload_temp(&registry, &disabled).await.expect("sweep"),
            0
        );
        assert!(stale.exists());
    }

    #[tokio::test]
    async fn missing_file_field_is_a_validation_error() {
        let temp = tempdir().expect("tempdir");
        let request = multipart_request(&[Part {
            name: "folder",
            file_name: None,
            data: b"docs",
        }]);

        let result = upload_file(
            Extension(make_ctx(temp.path().join("shared"), 1024, &["*/*"])),
            upload_config(1024),
            request,
        )
        .await;

        assert!(matches!(result, Err(ApiError::ValidationError(_))));
    }

    #[test]
    fn effective_limit_is_the_smaller_ceiling() {
        let ctx = make_ctx(PathBuf::from("unused"), 50, &["*/*"]);
        assert_eq!(
            UploadConfig {
                max_file_size: 100,
                temp_ttl: Duration::ZERO,
            }
            .effective_limit(&ctx.tenant.policy),
            50
        );
        assert_eq!(
            UploadConfig {
                max_file_size: 10,
                temp_ttl: Duration::ZERO,
            }
            .effective_limit(&ctx.tenant.policy),
            10
        );
    }
}
