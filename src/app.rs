//! 路由装配：文件 API、登录与健康检查，以及公共中间件层。

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::auth::{self, AuthConfig};
use crate::files::{self, DeletePolicy};
use crate::health;
use crate::http::{add_security_headers, build_cors_layer, resolve_client_ip};
use crate::tenant::TenantRegistry;
use crate::upload::{self, UploadConfig};

/// 进程级共享组件，启动时构建一次。
#[derive(Clone)]
pub struct AppComponents {
    pub registry: Arc<TenantRegistry>,
    pub auth: Arc<AuthConfig>,
    pub upload: Arc<UploadConfig>,
    pub delete_policy: Arc<dyn DeletePolicy>,
}

pub fn build_router(components: AppComponents, allowed_origins: &str) -> Router {
    let api = Router::new()
        .route(
            "/api/files/upload",
            post(upload::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/files/list/{tenant}", get(files::list_files))
        .route("/api/files/search/{tenant}", post(files::search_files))
        .route("/api/files/download/{file_id}", get(files::download_file))
        .route("/api/files/metadata/{file_id}", get(files::get_metadata))
        .route(
            "/api/files/{file_id}",
            delete(files::delete_file).post(files::bulk_delete),
        )
        .route_layer(middleware::from_fn(auth::request_context_middleware));

    let mut app = Router::new()
        .route("/health", get(health::health))
        .route("/login", post(auth::login))
        .merge(api)
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                        tenant = tracing::field::Empty,
                        user = tracing::field::Empty,
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(components.registry))
        .layer(Extension(components.auth))
        .layer(Extension(components.upload))
        .layer(Extension(components.delete_policy));

    if let Some(cors_layer) = build_cors_layer(allowed_origins) {
        app = app.layer(cors_layer);
    }
    app
}
