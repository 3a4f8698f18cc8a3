use super::BackingStore;
use crate::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;

/// Compare-and-delete; a plain GET + DEL would race with a new holder
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Distributed store on Redis.
///
/// The connection manager is created on first use and retried on every call
/// until it succeeds; after that it reconnects on its own.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    redis: Arc<OnceCell<ConnectionManager>>,
    key_prefix: String,
    release_script: redis::Script,
}

impl RedisStore {
    /// Store over `client`; no connection is made yet
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        RedisStore {
            client,
            redis: Arc::new(OnceCell::new()),
            key_prefix: key_prefix.into(),
            release_script: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    /// Parse `url` without connecting
    pub fn open(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        Ok(Self::new(redis::Client::open(url)?, key_prefix))
    }

    /// Parse `url` and establish the connection manager
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let store = Self::open(url, key_prefix)?;
        store.connection().await?;
        info!("Connected to Redis backing store");
        Ok(store)
    }

    /// Whether a connection manager has been established
    pub fn is_connected(&self) -> bool {
        self.redis.initialized()
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let redis = self
            .redis
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(redis.clone())
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    fn strip<'a>(&self, full: &'a str) -> &'a str {
        full.strip_prefix(&self.key_prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(full)
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Escape glob metacharacters so `prefix` matches literally in `SCAN MATCH`
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl BackingStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut self.connection().await?)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let deleted: i64 = self
            .release_script
            .key(self.key(key))
            .arg(token)
            .invoke_async(&mut self.connection().await?)
            .await?;
        Ok(deleted > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.connection().await?.get(self.key(key)).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut self.connection().await?).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.connection().await?.exists(self.key(key)).await?)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let deleted: i64 = self.connection().await?.del(self.key(key)).await?;
        Ok(deleted > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", escape_glob(&self.key(prefix)));
        let mut redis = self.connection().await?;
        let mut iter: redis::AsyncIter<'_, String> = redis.scan_match(pattern).await?;

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(self.strip(&key).to_string());
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
