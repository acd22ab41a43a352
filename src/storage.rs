use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::ErrorKind;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::codec::{
    decode_stored_name, is_hidden, is_valid_file_id, matches_file_id, mime_for_extension,
    public_url,
};
use crate::tenant::Tenant;

/// 单个租户的存储目录视图。文件系统是唯一的数据来源，记录按需重建。
#[derive(Clone, Debug)]
pub struct Storage {
    tenant_id: String,
    root: PathBuf,
}

impl Storage {
    pub fn new(tenant_id: impl Into<String>, root: PathBuf) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            root,
        }
    }

    pub fn for_tenant(tenant: &Tenant) -> Self {
        Self::new(tenant.id.clone(), tenant.root.clone())
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// 解析上传子目录，拒绝越界与符号链接。
    pub async fn resolve_folder_checked(&self, folder: &str) -> Result<PathBuf, StorageError> {
        let target = self.root.join(normalize_relative(folder)?);
        self.ensure_no_symlink_components(&target, true).await?;
        Ok(target)
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 递归扫描租户目录，返回每个文件的记录；目录不存在时返回空列表。
    pub async fn scan(&self, cancel: CancellationToken) -> Result<Vec<FileRecord>, StorageError> {
        let storage = self.clone();
        let records = tokio::task::spawn_blocking(move || storage.scan_blocking(&cancel))
            .await
            .map_err(|err| StorageError::Io(io::Error::other(err.to_string())))??;
        debug!(
            tenant = self.tenant_id,
            count = records.len(),
            "storage scan finished"
        );
        Ok(records)
    }

    fn scan_blocking(&self, cancel: &CancellationToken) -> Result<Vec<FileRecord>, StorageError> {
        let mut records = Vec::new();
        if !self.root_exists()? {
            return Ok(records);
        }

        for entry in visible_entries(&self.root) {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = entry.metadata()?;
            records.push(self.record_for(entry.path(), &metadata));
        }
        Ok(records)
    }

    /// 按文件 ID 定位文件（等价于 `root/**/{id}.*`）。多个匹配视为错误。
    pub async fn locate(&self, file_id: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_file_id(file_id) {
            return Err(StorageError::NotFound(file_id.to_string()));
        }
        let storage = self.clone();
        let id = file_id.to_string();
        tokio::task::spawn_blocking(move || storage.locate_blocking(&id))
            .await
            .map_err(|err| StorageError::Io(io::Error::other(err.to_string())))?
    }

    fn locate_blocking(&self, file_id: &str) -> Result<PathBuf, StorageError> {
        if !self.root_exists()? {
            return Err(StorageError::NotFound(file_id.to_string()));
        }

        let mut matches = Vec::new();
        for entry in visible_entries(&self.root) {
            let entry = entry?;
            if entry.file_type().is_file()
                && matches_file_id(&entry.file_name().to_string_lossy(), file_id)
            {
                matches.push(entry.into_path());
            }
        }

        match matches.len() {
            0 => Err(StorageError::NotFound(file_id.to_string())),
            1 => Ok(matches.remove(0)),
            _ => {
                warn!(
                    tenant = self.tenant_id,
                    file_id,
                    paths = ?matches,
                    "file id resolves to more than one stored file"
                );
                Err(StorageError::Ambiguous(file_id.to_string()))
            }
        }
    }

    /// 定位并用最新的文件状态构建记录。
    pub async fn load_record(&self, file_id: &str) -> Result<FileRecord, StorageError> {
        let path = self.locate(file_id).await?;
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(file_id.to_string()));
            }
            Err(err) => return Err(StorageError::Io(err)),
        };
        Ok(self.record_for(&path, &metadata))
    }

    pub async fn remove(&self, record: &FileRecord) -> Result<(), StorageError> {
        match fs::remove_file(&record.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(record.file_id.clone()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// 由磁盘路径与元数据反推文件记录。
    pub fn record_for(&self, path: &Path, metadata: &Metadata) -> FileRecord {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let decoded = decode_stored_name(&file_name);
        let folder = path
            .parent()
            .and_then(|parent| parent.strip_prefix(&self.root).ok())
            .map(folder_string)
            .unwrap_or_default();
        let uploaded_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        FileRecord {
            url: public_url(&self.tenant_id, &folder, &file_name),
            mime_type: mime_for_extension(&decoded.extension),
            file_id: decoded.file_id,
            original_name: decoded.original_name,
            file_name,
            client: self.tenant_id.clone(),
            folder,
            size: metadata.len(),
            extension: decoded.extension,
            uploaded_at,
            path: path.to_path_buf(),
            hash: None,
        }
    }

    fn root_exists(&self) -> Result<bool, StorageError> {
        match std::fs::metadata(&self.root) {
            Ok(metadata) if metadata.is_dir() => Ok(true),
            Ok(_) => Err(StorageError::InvalidPath),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

/// 按文件名排序遍历，跳过隐藏条目，保证多次扫描顺序一致。
fn visible_entries(root: &Path) -> impl Iterator<Item = Result<walkdir::DirEntry, walkdir::Error>> {
    WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_hidden(&entry.file_name().to_string_lossy()))
}

fn folder_string(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// 规范化相对路径；出现 `..`、根目录或盘符前缀时拒绝。
pub fn normalize_relative(value: &str) -> Result<PathBuf, StorageError> {
    let mut normalized = PathBuf::new();
    for component in Path::new(value).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidPath);
            }
        }
    }
    Ok(normalized)
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid path")]
    InvalidPath,
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file id {0} is ambiguous")]
    Ambiguous(String),
    #[error("scan cancelled")]
    Cancelled,
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 由文件系统重建的文件记录，只读快照。
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub file_id: String,
    pub original_name: String,
    pub file_name: String,
    pub client: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub folder: String,
    pub size: u64,
    pub mime_type: String,
    pub extension: String,
    pub uploaded_at: DateTime<Utc>,
    pub url: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}
