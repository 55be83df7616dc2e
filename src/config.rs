//! CLI arguments and server configuration defaults.

use clap::{Parser, Subcommand};
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

pub const DEFAULT_AUTH_USER: &str = "admin";
pub const DEFAULT_AUTH_PASS: &str = "admin";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_DOWNLOAD_TOKEN_TTL_SECS: u64 = 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 300;
pub const TOKEN_PRUNE_INTERVAL_SECS: u64 = 60;
pub const PBKDF2_ROUNDS: u32 = 100_000;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "filegate", version = VERSION_INFO, about = "Filegate download server")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
    #[arg(
        short = 'r',
        long,
        env = "FILEGATE_ROOT",
        default_value = "./shared",
        help = "Root directory exposed for listing and download"
    )]
    pub root_dir: String,
    #[arg(
        short = 'u',
        long,
        env = "FILEGATE_USERS_FILE",
        help = "JSON users file with PBKDF2 password hashes"
    )]
    pub users_file: Option<String>,
    #[arg(
        long,
        env = "FILEGATE_AUTH_USER",
        default_value = DEFAULT_AUTH_USER,
        help = "Fallback username when no users file is configured"
    )]
    pub auth_user: String,
    #[arg(
        long,
        env = "FILEGATE_AUTH_PASS",
        default_value = DEFAULT_AUTH_PASS,
        help = "Fallback password when no users file is configured"
    )]
    pub auth_pass: String,
    #[arg(
        short = 'b',
        long,
        env = "FILEGATE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "FILEGATE_HTTP_PORT",
        default_value_t = 8000,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "FILEGATE_HTTPS_PORT",
        default_value_t = 8443,
        help = "HTTPS port"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "FILEGATE_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "FILEGATE_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "FILEGATE_CORS_ORIGINS",
        help = "Comma separated CORS origins"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "FILEGATE_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Session expiration in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "FILEGATE_DOWNLOAD_TOKEN_TTL_SECS",
        default_value_t = DEFAULT_DOWNLOAD_TOKEN_TTL_SECS,
        help = "One-time download token expiration in seconds"
    )]
    pub download_token_ttl_secs: u64,
    #[arg(
        long,
        env = "FILEGATE_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max login attempts before lockout (0 to disable)"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "FILEGATE_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Login attempt window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "FILEGATE_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Login lockout time after max attempts"
    )]
    pub login_lockout_secs: u64,
}

/// Maintenance subcommands that run instead of the server.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add or update a user in the users file.
    AddUser {
        #[arg(help = "Username to create or update")]
        username: String,
        #[arg(help = "Plaintext password, hashed before storage")]
        password: String,
    },
}
