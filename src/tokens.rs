//! 一次性下载令牌的签发与原子消费。

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// In-memory store of single-use download tokens. Tokens ride in URLs, so
/// they are short-lived and bound to both the normalized path and the
/// hashed client IP they were issued for.
#[derive(Debug)]
pub struct DownloadTokens {
    tokens: Mutex<HashMap<String, DownloadToken>>,
    ttl: Duration,
}

#[derive(Debug)]
struct DownloadToken {
    path: String,
    expires_at: Instant,
    ip_hash: String,
}

impl DownloadTokens {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// 为指定的规范化路径签发新令牌。
    pub async fn issue(&self, path: &str, client_ip: IpAddr) -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = URL_SAFE_NO_PAD.encode(raw);

        let mut tokens = self.tokens.lock().await;
        tokens.insert(
            token.clone(),
            DownloadToken {
                path: path.to_string(),
                expires_at: Instant::now() + self.ttl,
                ip_hash: hash_ip(client_ip),
            },
        );
        token
    }

    /// 消费令牌：路径、IP 与有效期全部匹配时删除并放行。
    ///
    /// The whole check-and-remove runs under one lock, so two concurrent
    /// requests presenting the same token see exactly one success.
    pub async fn consume(&self, token: &str, path: &str, client_ip: IpAddr) -> bool {
        let mut tokens = self.tokens.lock().await;
        let now = Instant::now();

        match tokens.get(token) {
            None => false,
            Some(entry) if entry.expires_at <= now => {
                tokens.remove(token);
                false
            }
            Some(entry) => {
                if entry.path != path || entry.ip_hash != hash_ip(client_ip) {
                    // Mismatch does not spend the token; the legitimate
                    // holder can still use it until expiry.
                    debug!(path, "download token mismatch");
                    return false;
                }
                tokens.remove(token);
                true
            }
        }
    }

    /// 清理过期令牌，限制内存占用。
    pub async fn prune_expired(&self) {
        let mut tokens = self.tokens.lock().await;
        let now = Instant::now();
        tokens.retain(|_, entry| entry.expires_at > now);
    }
}

fn hash_ip(ip: IpAddr) -> String {
    let digest = Sha256::digest(ip.to_string().as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))
    }

    fn other_client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 99))
    }

    #[tokio::test]
    async fn token_is_single_use() {
        let store = DownloadTokens::new(Duration::from_secs(60));
        let token = store.issue("docs/a.txt", client()).await;
        assert!(store.consume(&token, "docs/a.txt", client()).await);
        assert!(!store.consume(&token, "docs/a.txt", client()).await);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let store = DownloadTokens::new(Duration::ZERO);
        let token = store.issue("docs/a.txt", client()).await;
        assert!(!store.consume(&token, "docs/a.txt", client()).await);
    }

    #[tokio::test]
    async fn path_mismatch_does_not_spend_token() {
        let store = DownloadTokens::new(Duration::from_secs(60));
        let token = store.issue("docs/a.txt", client()).await;
        assert!(!store.consume(&token, "docs/b.txt", client()).await);
        assert!(store.consume(&token, "docs/a.txt", client()).await);
    }

    #[tokio::test]
    async fn ip_mismatch_is_rejected() {
        let store = DownloadTokens::new(Duration::from_secs(60));
        let token = store.issue("docs/a.txt", client()).await;
        assert!(!store.consume(&token, "docs/a.txt", other_client()).await);
    }

    #[tokio::test]
    async fn concurrent_double_spend_yields_one_success() {
        let store = Arc::new(DownloadTokens::new(Duration::from_secs(60)));
        let token = store.issue("docs/a.txt", client()).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                store.consume(&token, "docs/a.txt", client()).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.expect("join") {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn prune_drops_only_expired_entries() {
        let live = DownloadTokens::new(Duration::from_secs(60));
        let token = live.issue("a", client()).await;
        live.prune_expired().await;
        assert!(live.consume(&token, "a", client()).await);

        let dead = DownloadTokens::new(Duration::ZERO);
        dead.issue("a", client()).await;
        dead.prune_expired().await;
        assert!(dead.tokens.lock().await.is_empty());
    }

    #[tokio::test]
    async fn issued_tokens_are_distinct() {
        let store = DownloadTokens::new(Duration::from_secs(60));
        let first = store.issue("a", client()).await;
        let second = store.issue("a", client()).await;
        assert_ne!(first, second);
        assert_eq!(first.len(), 43);
    }
}
