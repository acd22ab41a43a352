//! 上传暂存文件：写入隐藏的临时文件，完成后同步并重命名到最终位置。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use uuid::Uuid;

use crate::error::ApiError;

const STAGED_PREFIX: &str = ".upload-";
const STAGED_SUFFIX: &str = ".tmp";

/// 是否为上传暂存文件名。
pub fn is_staged_name(name: &str) -> bool {
    name.len() > STAGED_PREFIX.len() + STAGED_SUFFIX.len()
        && name.starts_with(STAGED_PREFIX)
        && name.ends_with(STAGED_SUFFIX)
}

/// 暂存路径守卫：未放置到最终位置前被丢弃时同步删除文件。
/// 上传 future 中途被取消（客户端断开、停机）时也能回收。
struct TempPathGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for TempPathGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// 可原子放置的暂存文件。
pub struct StagedFile {
    guard: TempPathGuard,
    file: File,
}

impl StagedFile {
    /// 在指定目录下创建隐藏的暂存文件（扫描时不可见）。
    pub async fn new(dir: &Path) -> Result<Self, ApiError> {
        let path = dir.join(format!("{STAGED_PREFIX}{}{STAGED_SUFFIX}", Uuid::new_v4()));
        let file = File::create(&path)
            .await
            .map_err(|err| ApiError::StorageWriteFailed(err.to_string()))?;
        Ok(Self {
            guard: TempPathGuard { path, armed: true },
            file,
        })
    }

    /// 返回暂存文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理暂存文件。
    pub async fn cleanup(self) {
        let Self { mut guard, file } = self;
        drop(file);
        if fs::remove_file(&guard.path).await.is_ok() {
            guard.armed = false;
        }
    }

    /// 同步内容并重命名到目标路径，失败时删除暂存文件。
    pub async fn finalize(self, target: &Path) -> Result<(), ApiError> {
        let Self { mut guard, file } = self;
        if let Err(err) = file.sync_all().await {
            return Err(ApiError::StorageWriteFailed(err.to_string()));
        }
        drop(file);

        if let Err(err) = fs::rename(&guard.path, target).await {
            return Err(ApiError::StorageWriteFailed(err.to_string()));
        }
        guard.armed = false;

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn finalize_moves_content_into_place() {
        let temp = tempdir().expect("tempdir");
        let target_dir = temp.path().join("folder");
        std::fs::create_dir_all(&target_dir).expect("create folder");
        let target = target_dir.join("file.bin");

        let mut staged = StagedFile::new(temp.path()).await.expect("staged file");
        staged.file_mut().write_all(b"abc").await.expect("write");
        staged.finalize(&target).await.expect("finalize");

        assert_eq!(std::fs::read(&target).expect("read target"), b"abc");
        let leftovers = std::fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".upload-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn cleanup_removes_staged_file() {
        let temp = tempdir().expect("tempdir");
        let staged = StagedFile::new(temp.path()).await.expect("staged file");
        staged.cleanup().await;
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }

    #[tokio::test]
    async fn dropped_staged_file_is_removed() {
        let temp = tempdir().expect("tempdir");
        let mut staged = StagedFile::new(temp.path()).await.expect("staged file");
        staged.file_mut().write_all(b"partial").await.expect("write");
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 1);

        drop(staged);
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }

    #[test]
    fn staged_names_are_recognized() {
        assert!(is_staged_name(".upload-0f8fad5b-d9cb-469f-a165-70867728950e.tmp"));
        assert!(!is_staged_name(".upload-.tmp"));
        assert!(!is_staged_name("upload-abc.tmp"));
        assert!(!is_staged_name(".upload-abc.bin"));
    }
}
