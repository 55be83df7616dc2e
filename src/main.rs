//! Filegate server binary.
//!
//! An authenticated directory-listing and file-download service over a
//! single configured root. Downloads are gated by short-lived single-use
//! tokens so browser anchor tags never carry the bearer credential. The
//! main entry point builds the Axum router, configures TLS, and starts
//! HTTP/HTTPS listeners.

mod auth;
mod background;
mod config;
mod error;
mod files;
mod http;
mod logging;
mod storage;
mod tls;
mod tokens;
mod version;

use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Mutex;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::auth::AuthState;
use crate::background::spawn_background_tasks;
use crate::config::{Args, Command};
use crate::http::build_cors_layer;
use crate::storage::Storage;
use crate::tokens::DownloadTokens;

shadow!(build);

/// Starts the Filegate server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();

    if let Some(Command::AddUser { username, password }) = &args.command {
        let Some(users_file) = args.users_file.as_deref() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "add-user requires --users-file",
            ));
        };
        auth::add_user_to_file(std::path::Path::new(users_file), username, password)?;
        info!(%username, users_file, "user record written");
        return Ok(());
    }

    let storage = Arc::new(Storage::new(PathBuf::from(args.root_dir.clone())));
    storage.ensure_root().await?;

    let users = auth::load_users(args.users_file.as_deref(), &args.auth_user, &args.auth_pass)?;
    let auth_state = Arc::new(AuthState {
        users,
        dummy_hash: auth::hash_password(&uuid::Uuid::new_v4().to_string()),
        sessions: Mutex::new(HashMap::new()),
        session_ttl: Duration::from_secs(args.session_ttl_secs),
        login_attempts: Mutex::new(HashMap::new()),
        login_window: Duration::from_secs(args.login_window_secs),
        login_max_attempts: args.login_max_attempts,
        login_lockout: Duration::from_secs(args.login_lockout_secs),
    });
    let download_tokens = Arc::new(DownloadTokens::new(Duration::from_secs(
        args.download_token_ttl_secs,
    )));
    let auth_for_tasks = auth_state.clone();
    let tokens_for_tasks = download_tokens.clone();

    let mut app = Router::new()
        .route("/login", post(auth::auth_login))
        .route("/logout", post(auth::auth_logout))
        .route("/files", get(files::list_files))
        .route(
            "/download-token/{*path}",
            post(files::issue_download_token),
        )
        .route("/download/{*path}", get(files::download_file))
        .route("/version", get(version::get_version_info))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(auth_state))
        .layer(Extension(download_tokens));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let https_addr = SocketAddr::new(host, args.https_port);
    let tls_config = tls::build_rustls_config(&args, host).await?;
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", http_addr);
    info!("🔒 Starting HTTPS server at {}", https_addr);

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());
    let https_server = axum_server::bind_rustls(https_addr, tls_config)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(auth_for_tasks, tokens_for_tasks);
    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
