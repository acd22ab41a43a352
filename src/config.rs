//! CLI 参数、环境变量与服务默认配置。

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const SERVICE_NAME: &str = "file-server";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";
pub const DEFAULT_JWT_SECRET: &str = "default_secret_change_in_production";
pub const DEFAULT_CLIENT: &str = "shared";
pub const DEFAULT_ADMIN_USER: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";
pub const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;
pub const LOGIN_TOKEN_CLIENT: &str = "shared";
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const LOGIN_PRUNE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_UPLOAD_TEMP_TTL_SECS: u64 = 24 * 60 * 60;
pub const UPLOAD_CLEAN_INTERVAL_SECS: u64 = 900;
pub const DOWNLOAD_CACHE_CONTROL: &str = "public, max-age=31536000";
pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 1000;
pub const MAX_BULK_DELETE: usize = 100;
pub const MAX_FOLDER_LEN: usize = 50;

/// CLI 参数与环境变量配置，进程启动时解析一次。
#[derive(Parser, Debug)]
#[command(name = "tenant-file-server", version = VERSION_INFO, about = "Multi-tenant file server")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        short = 'u',
        long,
        env = "UPLOAD_DIR",
        default_value = DEFAULT_UPLOAD_DIR,
        help = "Base directory holding every tenant storage root"
    )]
    pub upload_dir: String,
    #[arg(
        long,
        env = "MAX_FILE_SIZE",
        default_value = "100MB",
        value_parser = parse_size,
        help = "Global upload ceiling, bytes or with KB/MB/GB suffix"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "ALLOWED_ORIGINS",
        default_value = DEFAULT_ALLOWED_ORIGINS,
        help = "Comma separated CORS origins"
    )]
    pub allowed_origins: String,
    #[arg(
        long,
        env = "JWT_SECRET",
        default_value = DEFAULT_JWT_SECRET,
        hide_env_values = true,
        help = "HMAC secret for bearer tokens"
    )]
    pub jwt_secret: String,
    #[arg(
        long,
        env = "DEFAULT_CLIENT",
        default_value = DEFAULT_CLIENT,
        help = "Tenant used when a request names none"
    )]
    pub default_client: String,
    #[arg(
        long,
        env = "ADMIN_USER",
        default_value = DEFAULT_ADMIN_USER,
        help = "Admin username for /login"
    )]
    pub admin_user: String,
    #[arg(
        long,
        env = "ADMIN_PASSWORD",
        default_value = DEFAULT_ADMIN_PASSWORD,
        hide_env_values = true,
        help = "Admin password for /login"
    )]
    pub admin_password: String,
    #[arg(
        long,
        env = "TENANTS_FILE",
        help = "JSON file replacing the built-in tenant table"
    )]
    pub tenants_file: Option<String>,
    #[arg(
        long,
        env = "LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max failed logins before lockout (0 to disable)"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Failed login window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Lockout time after max failed logins"
    )]
    pub login_lockout_secs: u64,
    #[arg(
        long,
        env = "UPLOAD_TEMP_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_TEMP_TTL_SECS,
        help = "Age after which abandoned upload temp files are removed (0 to disable)"
    )]
    pub upload_temp_ttl_secs: u64,
}

/// 解析带单位的大小（`100MB`、`512KB`、`1GB` 或纯字节数）。
pub fn parse_size(value: &str) -> Result<u64, String> {
    let normalized = value.trim().to_ascii_uppercase();
    let (digits, multiplier) = if let Some(rest) = normalized.strip_suffix("GB") {
        (rest, 1024 * 1024 * 1024)
    } else if let Some(rest) = normalized.strip_suffix("MB") {
        (rest, 1024 * 1024)
    } else if let Some(rest) = normalized.strip_suffix("KB") {
        (rest, 1024)
    } else {
        (normalized.as_str(), 1)
    };
    let amount: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size: {value}"))?;
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size overflows: {value}"))
}
