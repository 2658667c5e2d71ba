use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

/// Upper bound for a single roundtrip. Pipelines only do point reads and
/// writes here, so anything slower than this is treated as an outage.
const KV_TIMEOUT_MILLISECS: u64 = 2000;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("kv command timed out")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("kv command failed: {0}")]
    Command(#[from] redis::RedisError),
}

/// The key-value and pub/sub operations the service needs, as a trait so
/// tests can swap in an in-memory implementation.
#[async_trait]
pub trait KvClient {
    async fn get(&self, k: String) -> Result<Option<String>, KvError>;

    /// SET with expiry, unconditionally overwriting.
    async fn set_ex(&self, k: String, v: String, ttl: Duration) -> Result<(), KvError>;

    /// SET NX with expiry. Returns true when the key was claimed by this
    /// call, false when it already existed.
    async fn set_nx_ex(&self, k: String, v: String, ttl: Duration) -> Result<bool, KvError>;

    async fn del(&self, k: String) -> Result<(), KvError>;

    async fn keys(&self, pattern: String) -> Result<Vec<String>, KvError>;

    /// Fire a pub/sub message at `channel`. Subscriber count is ignored.
    async fn publish(&self, channel: String, payload: String) -> Result<(), KvError>;

    async fn ping(&self) -> Result<(), KvError>;
}

pub struct RedisKvClient {
    client: redis::Client,
}

impl RedisKvClient {
    pub fn new(addr: String) -> anyhow::Result<RedisKvClient> {
        let client = redis::Client::open(addr)?;

        Ok(RedisKvClient { client })
    }
}

#[async_trait]
impl KvClient for RedisKvClient {
    async fn get(&self, k: String) -> Result<Option<String>, KvError> {
        let mut conn = self.client.get_async_connection().await?;

        let fut = timeout(
            Duration::from_millis(KV_TIMEOUT_MILLISECS),
            conn.get::<_, Option<String>>(k),
        )
        .await?;

        Ok(fut?)
    }

    async fn set_ex(&self, k: String, v: String, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.client.get_async_connection().await?;

        let fut = timeout(
            Duration::from_millis(KV_TIMEOUT_MILLISECS),
            conn.set_ex::<_, _, ()>(k, v, ttl.as_secs() as usize),
        )
        .await?;

        Ok(fut?)
    }

    async fn set_nx_ex(&self, k: String, v: String, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.client.get_async_connection().await?;

        // SET k v NX EX ttl replies OK when the key was claimed, nil otherwise.
        let mut cmd = redis::cmd("SET");
        cmd.arg(&k).arg(&v).arg("NX").arg("EX").arg(ttl.as_secs());

        let reply: Option<String> = timeout(
            Duration::from_millis(KV_TIMEOUT_MILLISECS),
            cmd.query_async(&mut conn),
        )
        .await??;

        Ok(reply.is_some())
    }

    async fn del(&self, k: String) -> Result<(), KvError> {
        let mut conn = self.client.get_async_connection().await?;

        let fut = timeout(
            Duration::from_millis(KV_TIMEOUT_MILLISECS),
            conn.del::<_, ()>(k),
        )
        .await?;

        Ok(fut?)
    }

    async fn keys(&self, pattern: String) -> Result<Vec<String>, KvError> {
        let mut conn = self.client.get_async_connection().await?;

        let fut = timeout(
            Duration::from_millis(KV_TIMEOUT_MILLISECS),
            conn.keys::<_, Vec<String>>(pattern),
        )
        .await?;

        Ok(fut?)
    }

    async fn publish(&self, channel: String, payload: String) -> Result<(), KvError> {
        let mut conn = self.client.get_async_connection().await?;

        let fut = timeout(
            Duration::from_millis(KV_TIMEOUT_MILLISECS),
            conn.publish::<_, _, ()>(channel, payload),
        )
        .await?;

        Ok(fut?)
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.client.get_async_connection().await?;

        let fut = timeout(
            Duration::from_millis(KV_TIMEOUT_MILLISECS),
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await?;

        fut?;
        Ok(())
    }
}

/// In-memory stand-in for tests. TTLs are recorded but never enforced;
/// published messages are captured per channel for assertions.
#[derive(Clone, Default)]
pub struct MockKvClient {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    entries: HashMap<String, (String, Duration)>,
    published: Vec<(String, String)>,
}

impl MockKvClient {
    pub fn new() -> MockKvClient {
        MockKvClient::default()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn insert(&self, k: &str, v: &str) {
        self.state
            .lock()
            .unwrap()
            .entries
            .insert(k.to_string(), (v.to_string(), Duration::ZERO));
    }
}

#[async_trait]
impl KvClient for MockKvClient {
    async fn get(&self, k: String) -> Result<Option<String>, KvError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .entries
            .get(&k)
            .map(|(v, _)| v.clone()))
    }

    async fn set_ex(&self, k: String, v: String, ttl: Duration) -> Result<(), KvError> {
        self.state.lock().unwrap().entries.insert(k, (v, ttl));
        Ok(())
    }

    async fn set_nx_ex(&self, k: String, v: String, ttl: Duration) -> Result<bool, KvError> {
        let mut state = self.state.lock().unwrap();
        if state.entries.contains_key(&k) {
            return Ok(false);
        }
        state.entries.insert(k, (v, ttl));
        Ok(true)
    }

    async fn del(&self, k: String) -> Result<(), KvError> {
        self.state.lock().unwrap().entries.remove(&k);
        Ok(())
    }

    async fn keys(&self, pattern: String) -> Result<Vec<String>, KvError> {
        let prefix = pattern.trim_end_matches('*');
        Ok(self
            .state
            .lock()
            .unwrap()
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn publish(&self, channel: String, payload: String) -> Result<(), KvError> {
        self.state.lock().unwrap().published.push((channel, payload));
        Ok(())
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}
