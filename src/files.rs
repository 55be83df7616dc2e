//! 文件列表、下载令牌签发与下载处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path as UrlPath, Query, connect_info::ConnectInfo};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum_extra::extract::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use httpdate::{fmt_http_date, parse_http_date};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::auth::{AuthState, is_session_valid};
use crate::error::ApiError;
use crate::http::resolve_client_ip;
use crate::storage::{FileEntry, SortKey, SortOrder, Storage, sort_entries};
use crate::tokens::DownloadTokens;

#[derive(Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    path: String,
    #[serde(default)]
    sort: SortKey,
    #[serde(default)]
    order: SortOrder,
    q: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct DownloadQuery {
    token: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct TokenResponse {
    token: String,
}

/// 列出目录内容：目录在前，名称使用自然序比较。
pub async fn list_files(
    Query(query): Query<ListQuery>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<Vec<FileEntry>>, ApiError> {
    let mut entries = storage.list_dir(&query.path, query.q.as_deref()).await?;
    sort_entries(&mut entries, query.sort, query.order);
    info!(path = %query.path, count = entries.len(), "list files");
    Ok(JsonResponse(entries))
}

/// 为单个文件签发一次性下载令牌。
pub async fn issue_download_token(
    UrlPath(path): UrlPath<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(tokens): Extension<Arc<DownloadTokens>>,
) -> Result<JsonResponse<TokenResponse>, ApiError> {
    let target = storage.resolve_path_checked(&path).await?;
    let metadata = fs::metadata(&target).await.map_err(map_fs_error)?;
    if !metadata.is_file() {
        return Err(ApiError::NotFound);
    }

    let normalized = storage.normalize_virtual(&path)?;
    let client_ip = resolve_client_ip(&headers, addr.ip());
    let token = tokens.issue(&normalized, client_ip).await;
    debug!(path = %normalized, "download token issued");
    Ok(JsonResponse(TokenResponse { token }))
}

/// 下载文件：一次性令牌或 Bearer 会话任一有效即放行，支持 Range。
pub async fn download_file(
    UrlPath(path): UrlPath<String>,
    Query(query): Query<DownloadQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(auth): Extension<Arc<AuthState>>,
    Extension(tokens): Extension<Arc<DownloadTokens>>,
) -> Result<Response, ApiError> {
    let normalized = storage.normalize_virtual(&path)?;

    match (query.token.as_deref(), auth_header) {
        (Some(token), _) => {
            let client_ip = resolve_client_ip(&request_headers, addr.ip());
            if !tokens.consume(token, &normalized, client_ip).await {
                return Err(ApiError::Forbidden);
            }
        }
        // Legacy client variant: plain bearer download, no one-time token.
        (None, Some(TypedHeader(bearer))) => {
            if !is_session_valid(&auth, bearer.token()).await {
                return Err(ApiError::Unauthorized);
            }
        }
        (None, None) => return Err(ApiError::Unauthorized),
    }

    let target = storage.resolve_path_checked(&path).await?;
    let metadata = fs::metadata(&target).await.map_err(map_fs_error)?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("path is not a file".into()));
    }
    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let mime = mime_guess::from_path(&target).first_or_octet_stream();
    let filename = normalized.rsplit('/').next().unwrap_or(&normalized);

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("response header build failed".into()))?,
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(filename))
            .map_err(|_| ApiError::Internal("response header build failed".into()))?,
    );
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(ts) = modified {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(ts))
                .map_err(|_| ApiError::Internal("response header build failed".into()))?,
        );
    }
    let etag = etag_from_metadata(&metadata);
    response_headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag)
            .map_err(|_| ApiError::Internal("response header build failed".into()))?,
    );

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
            Err(_) => false,
        },
        None => true,
    };

    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let file = File::open(&target).await.map_err(map_fs_error)?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(path = %normalized, start, end, length, "download range request accepted");
        let mut file = file;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let stream = ReaderStream::new(file.take(length));
        response_headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, file_size))
                .map_err(|_| ApiError::Internal("response header build failed".into()))?,
        );
        response_headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&length.to_string())
                .map_err(|_| ApiError::Internal("response header build failed".into()))?,
        );
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&file_size.to_string())
            .map_err(|_| ApiError::Internal("response header build failed".into()))?,
    );
    info!(path = %normalized, size = file_size, "download full file");
    let stream = ReaderStream::new(file);
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

fn map_fs_error(err: std::io::Error) -> ApiError {
    match err.kind() {
        std::io::ErrorKind::NotFound => ApiError::NotFound,
        _ => ApiError::Internal(err.to_string()),
    }
}

fn content_disposition(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|ch| if ch == '"' || ch.is_control() { '_' } else { ch })
        .collect();
    format!("attachment; filename=\"{sanitized}\"")
}

fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    if let Ok(modified) = metadata.modified()
        && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
    {
        return format!(
            "W/\"{}-{}-{}\"",
            size,
            duration.as_secs(),
            duration.subsec_nanos()
        );
    }
    format!("W/\"{}\"", size)
}

/// 解析 Range 头，返回可读取的范围。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let mut parts = range.splitn(2, '-');
    let start_part = parts.next().unwrap_or_default();
    let end_part = parts.next().unwrap_or_default();

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        if suffix == 0 {
            return Ok(None);
        }
        let start = file_size.saturating_sub(suffix);
        (start, file_size.saturating_sub(1))
    } else {
        let start: u64 = start_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        let end: u64 = if end_part.is_empty() {
            file_size.saturating_sub(1)
        } else {
            end_part
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?
        };
        (start, end)
    };

    if start > end || start >= file_size || end >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }

    Ok(Some((start, end.min(file_size.saturating_sub(1)))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionEntry;
    use crate::storage::Storage;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, Instant};
    use tempfile::tempdir;
    use tokio::sync::Mutex;

    fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("shared");
        std::fs::create_dir_all(&root).expect("create storage root");
        (temp, Arc::new(Storage::new(root)))
    }

    fn make_auth() -> Arc<AuthState> {
        Arc::new(AuthState {
            users: HashMap::new(),
            dummy_hash: "x$y".to_string(),
            sessions: Mutex::new(HashMap::new()),
            session_ttl: Duration::from_secs(60),
            login_attempts: Mutex::new(HashMap::new()),
            login_window: Duration::from_secs(60),
            login_max_attempts: 0,
            login_lockout: Duration::from_secs(60),
        })
    }

    fn make_tokens() -> Arc<DownloadTokens> {
        Arc::new(DownloadTokens::new(Duration::from_secs(60)))
    }

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000)
    }

    async fn fetch_download(
        path: &str,
        token: Option<String>,
        bearer: Option<&str>,
        storage: Arc<Storage>,
        auth: Arc<AuthState>,
        tokens: Arc<DownloadTokens>,
    ) -> Result<Response, ApiError> {
        let auth_header = bearer.map(|token| {
            TypedHeader(Authorization::bearer(token).expect("bearer header"))
        });
        download_file(
            UrlPath(path.to_string()),
            Query(DownloadQuery { token }),
            ConnectInfo(addr()),
            auth_header,
            HeaderMap::new(),
            Extension(storage),
            Extension(auth),
            Extension(tokens),
        )
        .await
    }

    #[tokio::test]
    async fn list_returns_direct_children_only() {
        let (_temp, storage) = make_storage();
        let root = storage.root_path();
        std::fs::create_dir(root.join("docs")).expect("mkdir");
        std::fs::write(root.join("docs/a.txt"), b"0123456789").expect("write");
        std::fs::write(root.join("docs/b.txt"), b"xy").expect("write");
        std::fs::create_dir(root.join("docs/nested")).expect("mkdir");
        std::fs::write(root.join("docs/nested/deep.txt"), b"z").expect("write");

        let response = list_files(
            Query(ListQuery {
                path: "docs".to_string(),
                sort: SortKey::Name,
                order: SortOrder::Asc,
                q: None,
            }),
            Extension(storage),
        )
        .await
        .expect("list");

        let names: Vec<_> = response.0.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["nested", "a.txt", "b.txt"]);
        let a = response.0.iter().find(|e| e.name == "a.txt").unwrap();
        assert!(!a.is_dir);
        assert_eq!(a.size, 10);
        assert!(a.modified > 0);
    }

    #[tokio::test]
    async fn list_rejects_traversal_with_forbidden() {
        let (_temp, storage) = make_storage();
        let result = list_files(
            Query(ListQuery {
                path: "../outside".to_string(),
                sort: SortKey::Name,
                order: SortOrder::Asc,
                q: None,
            }),
            Extension(storage),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Forbidden)));
    }

    #[tokio::test]
    async fn issue_token_requires_regular_file() {
        let (_temp, storage) = make_storage();
        let root = storage.root_path();
        std::fs::create_dir(root.join("docs")).expect("mkdir");
        let tokens = make_tokens();

        for path in ["docs", "missing.txt"] {
            let result = issue_download_token(
                UrlPath(path.to_string()),
                ConnectInfo(addr()),
                HeaderMap::new(),
                Extension(storage.clone()),
                Extension(tokens.clone()),
            )
            .await;
            assert!(matches!(result, Err(ApiError::NotFound)), "path {path}");
        }

        let result = issue_download_token(
            UrlPath("../etc/passwd".to_string()),
            ConnectInfo(addr()),
            HeaderMap::new(),
            Extension(storage),
            Extension(tokens),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Forbidden)));
    }

    #[tokio::test]
    async fn token_download_round_trips_bytes_and_spends_token() {
        let (_temp, storage) = make_storage();
        let root = storage.root_path();
        std::fs::create_dir(root.join("docs")).expect("mkdir");
        let content = b"token gated payload".to_vec();
        std::fs::write(root.join("docs/a.txt"), &content).expect("write");
        let auth = make_auth();
        let tokens = make_tokens();

        let issued = issue_download_token(
            UrlPath("docs/a.txt".to_string()),
            ConnectInfo(addr()),
            HeaderMap::new(),
            Extension(storage.clone()),
            Extension(tokens.clone()),
        )
        .await
        .expect("issue");

        let response = fetch_download(
            "docs/a.txt",
            Some(issued.0.token.clone()),
            None,
            storage.clone(),
            auth.clone(),
            tokens.clone(),
        )
        .await
        .expect("download");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok()),
            Some("attachment; filename=\"a.txt\"")
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(body.as_ref(), content.as_slice());

        // Replaying the consumed token must fail.
        let replay = fetch_download(
            "docs/a.txt",
            Some(issued.0.token),
            None,
            storage,
            auth,
            tokens,
        )
        .await;
        assert!(matches!(replay, Err(ApiError::Forbidden)));
    }

    #[tokio::test]
    async fn bearer_download_is_supported_for_legacy_clients() {
        let (_temp, storage) = make_storage();
        std::fs::write(storage.root_path().join("a.txt"), b"legacy").expect("write");
        let auth = make_auth();
        auth.sessions.lock().await.insert(
            "session-token".to_string(),
            SessionEntry {
                expires_at: Instant::now() + Duration::from_secs(60),
            },
        );

        let response = fetch_download(
            "a.txt",
            None,
            Some("session-token"),
            storage.clone(),
            auth.clone(),
            make_tokens(),
        )
        .await
        .expect("download");
        assert_eq!(response.status(), StatusCode::OK);

        let unauthenticated =
            fetch_download("a.txt", None, None, storage.clone(), auth.clone(), make_tokens()).await;
        assert!(matches!(unauthenticated, Err(ApiError::Unauthorized)));

        let bad_session =
            fetch_download("a.txt", None, Some("wrong"), storage, auth, make_tokens()).await;
        assert!(matches!(bad_session, Err(ApiError::Unauthorized)));
    }

    #[tokio::test]
    async fn download_rejects_directories_and_traversal() {
        let (_temp, storage) = make_storage();
        std::fs::create_dir(storage.root_path().join("docs")).expect("mkdir");
        let auth = make_auth();
        auth.sessions.lock().await.insert(
            "s".to_string(),
            SessionEntry {
                expires_at: Instant::now() + Duration::from_secs(60),
            },
        );

        let dir = fetch_download(
            "docs",
            None,
            Some("s"),
            storage.clone(),
            auth.clone(),
            make_tokens(),
        )
        .await;
        assert!(matches!(dir, Err(ApiError::BadRequest(_))));

        let escape = fetch_download(
            "../etc/passwd",
            None,
            Some("s"),
            storage,
            auth,
            make_tokens(),
        )
        .await;
        assert!(matches!(escape, Err(ApiError::Forbidden)));
    }

    #[tokio::test]
    async fn range_request_returns_partial_content() {
        let (_temp, storage) = make_storage();
        std::fs::write(storage.root_path().join("a.bin"), b"0123456789").expect("write");
        let auth = make_auth();
        auth.sessions.lock().await.insert(
            "s".to_string(),
            SessionEntry {
                expires_at: Instant::now() + Duration::from_secs(60),
            },
        );

        let mut request_headers = HeaderMap::new();
        request_headers.insert(header::RANGE, HeaderValue::from_static("bytes=2-5"));
        let response = download_file(
            UrlPath("a.bin".to_string()),
            Query(DownloadQuery { token: None }),
            ConnectInfo(addr()),
            Some(TypedHeader(
                Authorization::bearer("s").expect("bearer header"),
            )),
            request_headers,
            Extension(storage),
            Extension(auth),
            Extension(make_tokens()),
        )
        .await
        .expect("download");

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok()),
            Some("bytes 2-5/10")
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(body.as_ref(), b"2345");
    }

    #[test]
    fn parse_range_accepts_suffix_and_open_ended_forms() {
        let header = HeaderValue::from_static("bytes=-4");
        assert_eq!(parse_range(Some(&header), 10).unwrap(), Some((6, 9)));
        let header = HeaderValue::from_static("bytes=3-");
        assert_eq!(parse_range(Some(&header), 10).unwrap(), Some((3, 9)));
    }

    #[test]
    fn parse_range_rejects_unsatisfiable() {
        let header = HeaderValue::from_static("bytes=10-20");
        assert!(matches!(
            parse_range(Some(&header), 10),
            Err(ApiError::RangeNotSatisfiable(10))
        ));
        let header = HeaderValue::from_static("bytes=5-2");
        assert!(matches!(
            parse_range(Some(&header), 10),
            Err(ApiError::RangeNotSatisfiable(10))
        ));
    }
}
