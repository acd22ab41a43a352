//! Multi-tenant file server binary.
//!
//! Each tenant owns an isolated directory tree with its own size, type and
//! authentication policy. The filesystem is the only metadata store: file
//! records are rebuilt from stored names on every request.

mod app;
mod atomic;
mod auth;
mod background;
mod codec;
mod config;
mod error;
mod etag;
mod files;
mod health;
mod http;
mod logging;
mod query;
mod response;
mod storage;
mod tenant;
mod upload;

use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::{AppComponents, build_router};
use crate::auth::AuthConfig;
use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::files::AllowAll;
use crate::storage::Storage;
use crate::tenant::{TenantRegistry, builtin_policies};
use crate::upload::UploadConfig;

shadow!(build);

/// Starts the file server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let base_dir = PathBuf::from(&args.upload_dir);
    let registry = match args.tenants_file.as_deref() {
        Some(path) => TenantRegistry::from_json_file(&base_dir, Path::new(path)),
        None => TenantRegistry::new(&base_dir, builtin_policies()),
    }
    .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    if !registry.exists(&args.default_client) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("default client {} is not a configured tenant", args.default_client),
        ));
    }

    for tenant_id in registry.list_all() {
        if let Some(tenant) = registry.lookup(&tenant_id)
            && let Err(err) = Storage::for_tenant(tenant).ensure_root().await
        {
            warn!(tenant = tenant_id, error = %err, "failed to create tenant storage root");
        }
    }

    let auth_config = Arc::new(
        AuthConfig::new(
            &args.jwt_secret,
            args.default_client.clone(),
            args.admin_user.clone(),
            args.admin_password.clone(),
        )
        .with_login_limits(
            args.login_max_attempts,
            Duration::from_secs(args.login_window_secs),
            Duration::from_secs(args.login_lockout_secs),
        ),
    );
    if args.jwt_secret == config::DEFAULT_JWT_SECRET {
        warn!("JWT_SECRET is not set, using the built-in development secret");
    }

    let tenants = registry.list_all();
    let registry = Arc::new(registry);
    let upload_config = Arc::new(UploadConfig {
        max_file_size: args.max_file_size,
        temp_ttl: Duration::from_secs(args.upload_temp_ttl_secs),
    });
    let components = AppComponents {
        registry: registry.clone(),
        auth: auth_config.clone(),
        upload: upload_config.clone(),
        delete_policy: Arc::new(AllowAll),
    };
    let app = build_router(components, &args.allowed_origins);

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        %addr,
        upload_dir = %base_dir.display(),
        ?tenants,
        default_client = args.default_client,
        "starting file server"
    );

    let shutdown = CancellationToken::new();
    spawn_background_tasks(auth_config, registry, upload_config, shutdown.clone());

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    shutdown.cancel();
}
