//! 登录失败记录清理与上传暂存文件清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::{AuthConfig, prune_login_attempts};
use crate::config::{LOGIN_PRUNE_INTERVAL_SECS, UPLOAD_CLEAN_INTERVAL_SECS};
use crate::tenant::TenantRegistry;
use crate::upload::{UploadConfig, cleanup_upload_temp};

/// 启动后台任务；`shutdown` 触发后退出。
pub fn spawn_background_tasks(
    auth: Arc<AuthConfig>,
    registry: Arc<TenantRegistry>,
    upload: Arc<UploadConfig>,
    shutdown: CancellationToken,
) {
    let login_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(LOGIN_PRUNE_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = login_shutdown.cancelled() => break,
                _ = interval.tick() => prune_login_attempts(&auth).await,
            }
        }
        debug!("login prune task stopped");
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(UPLOAD_CLEAN_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = cleanup_upload_temp(&registry, &upload).await {
                        warn!(error = %err, "upload temp cleanup failed");
                    }
                }
            }
        }
        debug!("upload temp cleanup task stopped");
    });
}
