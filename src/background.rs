//! 会话与下载令牌过期清理的后台任务。

use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthState, prune_expired_sessions, prune_login_attempts};
use crate::config::{SESSION_PRUNE_INTERVAL_SECS, TOKEN_PRUNE_INTERVAL_SECS};
use crate::tokens::DownloadTokens;

/// 启动后台任务（会话清理与下载令牌清理）。
pub fn spawn_background_tasks(auth: Arc<AuthState>, tokens: Arc<DownloadTokens>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            prune_expired_sessions(&auth).await;
            prune_login_attempts(&auth).await;
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(TOKEN_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            tokens.prune_expired().await;
        }
    });
}
