//! 健康检查处理器，附带构建信息。

use axum::response::Json as JsonResponse;
use serde::Serialize;

use crate::config::SERVICE_NAME;
use crate::response::ApiResponse;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthInfo {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    commit: &'static str,
    build_time: &'static str,
}

/// 返回服务状态与版本。
pub async fn health() -> JsonResponse<ApiResponse<HealthInfo>> {
    JsonResponse(ApiResponse::ok(HealthInfo {
        status: "ok",
        service: SERVICE_NAME,
        version: crate::build::PKG_VERSION,
        commit: crate::build::SHORT_COMMIT,
        build_time: crate::build::BUILD_TIME,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_service_and_version() {
        let JsonResponse(body) = health().await;
        let value = serde_json::to_value(&body).expect("serialize");
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["status"], "ok");
        assert_eq!(value["data"]["service"], SERVICE_NAME);
        assert_eq!(value["data"]["version"], env!("CARGO_PKG_VERSION"));
        assert!(value["data"].get("buildTime").is_some());
    }
}
