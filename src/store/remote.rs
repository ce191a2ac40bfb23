use super::{Reply, Script, ScriptRunner};
use crate::error::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{info, trace};

/// Script runner backed by a Redis server.
///
/// Scripts are sent with `EVALSHA` and transparently loaded on a
/// `NOSCRIPT` reply. The connection manager reconnects on failure.
#[derive(Clone)]
pub struct RedisRunner {
    conn: ConnectionManager,
}

impl RedisRunner {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis store at {}", url);
        Ok(Self { conn })
    }
}

#[async_trait]
impl ScriptRunner for RedisRunner {
    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<Reply> {
        let redis_script = redis::Script::new(script.source());
        let mut invocation = redis_script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        let mut conn = self.conn.clone();
        let value: redis::Value = invocation.invoke_async(&mut conn).await?;
        trace!(script = script.name(), ?value, "redis eval");
        Ok(Reply::from(value))
    }
}
