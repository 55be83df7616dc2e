//! 认证处理：用户库、会话管理与登录限流。

use axum::extract::{Extension, Form, connect_info::ConnectInfo};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Json as JsonResponse;
use axum::{body::Body as AxumBody, middleware};
use axum_extra::extract::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PBKDF2_ROUNDS;
use crate::error::ApiError;
use crate::http::resolve_client_ip;

#[derive(Debug)]
pub struct AuthState {
    /// username -> "salt$pbkdf2-sha256" password hash
    pub users: HashMap<String, String>,
    /// Hash verified for unknown usernames, so a miss costs the same work
    /// as a wrong password.
    pub dummy_hash: String,
    pub sessions: Mutex<HashMap<String, SessionEntry>>,
    pub session_ttl: Duration,
    pub login_attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    pub login_window: Duration,
    pub login_max_attempts: u32,
    pub login_lockout: Duration,
}

#[derive(Debug)]
pub struct SessionEntry {
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct LoginAttempt {
    pub window_start: Instant,
    pub failures: u32,
    pub locked_until: Option<Instant>,
}

/// JSON users file record, produced by the `add-user` subcommand.
#[derive(Debug, Deserialize, Serialize)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
}

/// 认证中间件：校验 Bearer 会话令牌。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthState>>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    if is_auth_exempt_path(req.uri().path()) {
        return Ok(next.run(req).await);
    }

    if let Some(TypedHeader(bearer)) = auth_header
        && is_session_valid(&auth, bearer.token()).await
    {
        return Ok(next.run(req).await);
    }

    Err(ApiError::Unauthorized)
}

fn is_auth_exempt_path(path: &str) -> bool {
    // /download validates its own one-time token or bearer; anchor-tag
    // navigation cannot set an Authorization header.
    path == "/login" || path == "/version" || path == "/download" || path.starts_with("/download/")
}

#[derive(Deserialize)]
pub(crate) struct LoginForm {
    username: String,
    password: String,
}

#[derive(Serialize)]
pub(crate) struct LoginResponse {
    access_token: String,
    token_type: &'static str,
}

/// 登录接口：校验口令并签发会话令牌。
pub async fn auth_login(
    Extension(auth): Extension<Arc<AuthState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(payload): Form<LoginForm>,
) -> Result<JsonResponse<LoginResponse>, ApiError> {
    let client_ip = resolve_client_ip(&headers, addr.ip());

    if let Some(retry_after) = check_login_rate_limit(&auth, client_ip).await {
        return Err(ApiError::TooManyRequests(retry_after));
    }

    let stored = auth.users.get(&payload.username).unwrap_or(&auth.dummy_hash);
    let known_user = auth.users.contains_key(&payload.username);
    if !verify_password(&payload.password, stored) || !known_user {
        register_login_failure(&auth, client_ip).await;
        return Err(ApiError::Unauthorized);
    }

    clear_login_failures(&auth, client_ip).await;

    let token = Uuid::new_v4().to_string();
    let expires_at = Instant::now() + auth.session_ttl;
    let mut sessions = auth.sessions.lock().await;
    sessions.insert(token.clone(), SessionEntry { expires_at });
    info!(username = %payload.username, "login ok");

    Ok(JsonResponse(LoginResponse {
        access_token: token,
        token_type: "bearer",
    }))
}

/// 登出接口：吊销当前会话。
pub async fn auth_logout(
    Extension(auth): Extension<Arc<AuthState>>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
) -> StatusCode {
    if let Some(TypedHeader(bearer)) = auth_header {
        remove_session(&auth, bearer.token()).await;
    }
    StatusCode::NO_CONTENT
}

pub async fn is_session_valid(auth: &AuthState, token: &str) -> bool {
    let mut sessions = auth.sessions.lock().await;
    let now = Instant::now();
    match sessions.get(token) {
        Some(entry) if entry.expires_at > now => true,
        _ => {
            sessions.remove(token);
            false
        }
    }
}

async fn remove_session(auth: &AuthState, token: &str) {
    let mut sessions = auth.sessions.lock().await;
    sessions.remove(token);
}

/// 生成 `salt$hash` 形式的 PBKDF2-SHA256 口令哈希。
pub fn hash_password(password: &str) -> String {
    let mut salt_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    hash_password_with_salt(password, &hex::encode(salt_bytes))
}

fn hash_password_with_salt(password: &str, salt: &str) -> String {
    let mut derived = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        salt.as_bytes(),
        PBKDF2_ROUNDS,
        &mut derived,
    );
    format!("{salt}${}", hex::encode(derived))
}

/// 校验口令是否匹配存储的哈希。
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, _)) = stored.split_once('$') else {
        return false;
    };
    hash_password_with_salt(password, salt) == stored
}

/// Loads the users map, either from a JSON file or from the single
/// fallback credential pair.
pub fn load_users(
    users_file: Option<&str>,
    fallback_user: &str,
    fallback_pass: &str,
) -> io::Result<HashMap<String, String>> {
    let mut users = HashMap::new();
    match users_file {
        Some(path) => {
            let data = std::fs::read(path)?;
            let records: Vec<UserRecord> = serde_json::from_slice(&data)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
            for record in records {
                users.insert(record.username, record.password_hash);
            }
        }
        None => {
            users.insert(fallback_user.to_string(), hash_password(fallback_pass));
        }
    }
    Ok(users)
}

/// Creates or updates a user entry in the JSON users file.
pub fn add_user_to_file(path: &Path, username: &str, password: &str) -> io::Result<()> {
    let mut records: Vec<UserRecord> = match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err),
    };

    let hash = hash_password(password);
    match records.iter_mut().find(|r| r.username == username) {
        Some(record) => record.password_hash = hash,
        None => records.push(UserRecord {
            username: username.to_string(),
            password_hash: hash,
        }),
    }

    let data = serde_json::to_vec_pretty(&records)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    std::fs::write(path, data)
}

async fn check_login_rate_limit(auth: &AuthState, ip: IpAddr) -> Option<u64> {
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
            return Some(locked_until.saturating_duration_since(now).as_secs());
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

async fn register_login_failure(auth: &AuthState, ip: IpAddr) {
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

async fn clear_login_failures(auth: &AuthState, ip: IpAddr) {
    let mut attempts = auth.login_attempts.lock().await;
    attempts.remove(&ip);
}

/// 清理过期会话。
pub async fn prune_expired_sessions(auth: &AuthState) {
    let mut sessions = auth.sessions.lock().await;
    let now = Instant::now();
    sessions.retain(|_, entry| entry.expires_at > now);
}

/// 清理过期的登录失败记录。
pub async fn prune_login_attempts(auth: &AuthState) {
    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    attempts.retain(|_, entry| {
        if let Some(locked_until) = entry.locked_until {
            return locked_until > now;
        }
        now.duration_since(entry.window_start) <= auth.login_window
    });
}
