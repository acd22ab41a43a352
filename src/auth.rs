//! 租户解析、Bearer 令牌认证、登录签发与登录限流。

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Json, Query};
use axum::http::{HeaderMap, Request, header};
use axum::response::{Json as JsonResponse, Response};
use axum::{body::Body as AxumBody, middleware};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{Span, info, warn};

use crate::config::{LOGIN_TOKEN_CLIENT, TOKEN_TTL_SECS};
use crate::error::ApiError;
use crate::http::ClientIp;
use crate::response::ApiResponse;
use crate::storage::Storage;
use crate::tenant::{Tenant, TenantRegistry};

/// 租户请求头。
pub const CLIENT_ID_HEADER: &str = "x-client-id";
/// 令牌中既无 `sub` 也无 `user_id` 时使用的用户标识。
pub const UNKNOWN_USER: &str = "unknown";

pub struct AuthConfig {
    pub default_tenant: String,
    pub admin_user: String,
    pub admin_password: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    pub login_attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    pub login_window: Duration,
    pub login_max_attempts: u32,
    pub login_lockout: Duration,
}

#[derive(Debug)]
pub struct LoginAttempt {
    pub window_start: Instant,
    pub failures: u32,
    pub locked_until: Option<Instant>,
}

impl AuthConfig {
    pub fn new(
        secret: &str,
        default_tenant: impl Into<String>,
        admin_user: impl Into<String>,
        admin_password: impl Into<String>,
    ) -> Self {
        // 只接受 HMAC 族算法；exp 存在时校验，不强制要求。
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            default_tenant: default_tenant.into(),
            admin_user: admin_user.into(),
            admin_password: admin_password.into(),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            login_attempts: Mutex::new(HashMap::new()),
            login_window: Duration::ZERO,
            login_max_attempts: 0,
            login_lockout: Duration::ZERO,
        }
    }

    pub fn with_login_limits(mut self, max_attempts: u32, window: Duration, lockout: Duration) -> Self {
        self.login_max_attempts = max_attempts;
        self.login_window = window;
        self.login_lockout = lockout;
        self
    }

    /// 校验令牌并取出用户标识：`sub`，其次 `user_id`，否则为 `unknown`。
    pub fn verify_token(&self, token: &str) -> Result<String, ApiError> {
        let data = decode::<BearerClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| ApiError::InvalidToken(err.to_string()))?;
        let claims = data.claims;
        let user_id = claims
            .sub
            .as_ref()
            .and_then(|value| value.as_str())
            .or_else(|| claims.user_id.as_ref().and_then(|value| value.as_str()))
            .map(str::to_string);
        match user_id {
            Some(user_id) => Ok(user_id),
            None => {
                warn!("token carries no subject or user_id claim");
                Ok(UNKNOWN_USER.to_string())
            }
        }
    }

    /// 签发 24 小时有效的登录令牌。
    pub fn issue_token(&self, username: &str) -> Result<(String, DateTime<Utc>), ApiError> {
        let issued_at = Utc::now();
        let expires_at = issued_at + ChronoDuration::seconds(TOKEN_TTL_SECS);
        let claims = LoginClaims {
            sub: username.to_string(),
            client: LOGIN_TOKEN_CLIENT.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| ApiError::Internal(format!("failed to sign token: {err}")))?;
        Ok((token, expires_at))
    }
}

#[derive(Debug, Deserialize)]
struct BearerClaims {
    #[serde(default)]
    sub: Option<serde_json::Value>,
    #[serde(default)]
    user_id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginClaims {
    sub: String,
    client: String,
    iat: i64,
    exp: i64,
}

/// 单个请求的上下文，由中间件创建并放入请求扩展。
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub tenant: Tenant,
    pub user_id: Option<String>,
}

impl RequestContext {
    pub fn tenant_id(&self) -> &str {
        &self.tenant.id
    }

    pub fn storage(&self) -> Storage {
        Storage::for_tenant(&self.tenant)
    }
}

#[derive(Deserialize)]
struct TenantQuery {
    client: Option<String>,
}

/// 请求上下文中间件：先解析租户，再按租户策略校验令牌。
pub async fn request_context_middleware(
    Extension(registry): Extension<Arc<TenantRegistry>>,
    Extension(auth): Extension<Arc<AuthConfig>>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let tenant_id = resolve_tenant_id(&req, &auth.default_tenant);
    let tenant = registry
        .lookup(&tenant_id)
        .cloned()
        .ok_or_else(|| ApiError::InvalidTenant(tenant_id.clone()))?;
    Span::current().record("tenant", tenant_id.as_str());

    let user_id = if tenant.policy.requires_auth {
        let token = extract_bearer(req.headers()).ok_or(ApiError::AuthRequired)?;
        let user_id = auth.verify_token(token)?;
        Span::current().record("user", user_id.as_str());
        Some(user_id)
    } else {
        None
    };

    req.extensions_mut()
        .insert(RequestContext { tenant, user_id });
    Ok(next.run(req).await)
}

/// 租户优先级：列表/搜索路径段 > `X-Client-Id` > `client` 查询参数 > 默认租户。
///
/// 路径段按百分号编码解码，与路由 `Path` 提取到的值一致。
fn resolve_tenant_id<B>(req: &Request<B>, default_tenant: &str) -> String {
    let segments: Vec<&str> = req.uri().path().trim_matches('/').split('/').collect();
    if let ["api", "files", "list" | "search", tenant, ..] = segments.as_slice()
        && !tenant.is_empty()
    {
        return percent_decode_str(tenant).decode_utf8_lossy().into_owned();
    }

    if let Some(tenant) = req
        .headers()
        .get(CLIENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        return tenant.to_string();
    }

    if let Some(tenant) = Query::<TenantQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(query)| query.client)
        .filter(|value| !value.is_empty())
    {
        return tenant;
    }

    default_tenant.to_string()
}

/// 仅接受 `Bearer <token>` 形式。
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    match value.split(' ').collect::<Vec<_>>().as_slice() {
        ["Bearer", token] if !token.is_empty() => Some(token),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginData {
    token: String,
    expires_at: DateTime<Utc>,
}

/// 登录接口：校验管理员凭据并签发令牌。
pub async fn login(
    Extension(auth): Extension<Arc<AuthConfig>>,
    ClientIp(client_ip): ClientIp,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<JsonResponse<ApiResponse<LoginData>>, ApiError> {
    let Json(payload) = payload.map_err(|err| ApiError::ValidationError(err.body_text()))?;

    if let Some(ip) = client_ip
        && let Some(retry_after) = check_login_rate_limit(&auth, ip).await
    {
        return Err(ApiError::TooManyRequests(retry_after));
    }

    if payload.username != auth.admin_user || payload.password != auth.admin_password {
        if let Some(ip) = client_ip {
            register_login_failure(&auth, ip).await;
        }
        warn!(username = payload.username, "login rejected");
        return Err(ApiError::InvalidCredentials);
    }

    if let Some(ip) = client_ip {
        clear_login_failures(&auth, ip).await;
    }

    let (token, expires_at) = auth.issue_token(&payload.username)?;
    info!(username = payload.username, "token issued");
    Ok(JsonResponse(
        ApiResponse::ok(LoginData { token, expires_at }).with_message("login successful"),
    ))
}

async fn check_login_rate_limit(auth: &AuthConfig, ip: IpAddr) -> Option<u64> {
    if auth.login_max_attempts == 0 {
        return None;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.entry(ip).or_insert(LoginAttempt {
        window_start: now,
        failures: 0,
        locked_until: None,
    });

    if let Some(locked_until) = entry.locked_until {
        if now < locked_until {
            return Some(locked_until.saturating_duration_since(now).as_secs().max(1));
        }
        entry.locked_until = None;
        entry.failures = 0;
        entry.window_start = now;
    }

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.window_start = now;
        entry.failures = 0;
    }

    None
}

async fn register_login_failure(auth: &AuthConfig, ip: IpAddr) {
    if auth.login_max_attempts == 0 {
        return;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.entry(ip).or_insert(LoginAttempt {
        window_start: now,
        failures: 0,
        locked_until: None,
    });

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.window_start = now;
        entry.failures = 0;
        entry.locked_until = None;
    }

    entry.failures = entry.failures.saturating_add(1);
    if entry.failures >= auth.login_max_attempts {
        entry.locked_until = Some(now + auth.login_lockout);
        warn!(client_ip = %ip, "login locked out");
    }
}

async fn clear_login_failures(auth: &AuthConfig, ip: IpAddr) {
    let mut attempts = auth.login_attempts.lock().await;
    attempts.remove(&ip);
}

/// 清理过期的登录失败记录。
pub async fn prune_login_attempts(auth: &AuthConfig) {
    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    attempts.retain(|_, entry| {
        if let Some(locked_until) = entry.locked_until {
            return locked_until > now;
        }
        now.duration_since(entry.window_start) <= auth.login_window
    });
}
