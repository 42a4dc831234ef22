//! Redis-backed key-value store (optional, `redis` feature).
//!
//! Uses blocking connections like the rest of the synchronous store layer;
//! each call opens a connection from the client.

use std::time::Duration;

use redis::Commands;

use super::{KvError, KvStore};

/// Redis key-value store.
#[derive(Debug, Clone)]
pub struct RedisKvStore {
    client: redis::Client,
}

impl RedisKvStore {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(unavailable)?;
        Ok(Self { client })
    }

    fn conn(&self) -> Result<redis::Connection, KvError> {
        self.client.get_connection().map_err(unavailable)
    }
}

fn unavailable(e: redis::RedisError) -> KvError {
    KvError::Unavailable(e.to_string())
}

/// `SET key value [PX ms]`.
fn set_cmd(key: &str, value: &str, ttl: Option<Duration>) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(ttl) = ttl {
        // PX 0 is rejected by Redis.
        cmd.arg("PX").arg((ttl.as_millis() as u64).max(1));
    }
    cmd
}

impl KvStore for RedisKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn()?;
        conn.get(key).map_err(unavailable)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn()?;
        set_cmd(key, value, ttl)
            .query::<()>(&mut conn)
            .map_err(unavailable)
    }

    fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.del(key).map_err(unavailable)?;
        Ok(removed > 0)
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn()?;
        let mut keys: Vec<String> = conn
            .scan_match::<_, String>(pattern)
            .map_err(unavailable)?
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn()?;

        // WATCH/MULTI/EXEC: `transaction` re-runs the closure if the key
        // changes between the read and EXEC.
        redis::transaction(&mut conn, &[key], |con, pipe| {
            let current: Option<String> = con.get(key)?;
            if current.as_deref() != expected {
                return Ok(Some(false));
            }
            pipe.add_command(set_cmd(key, value, ttl))
                .ignore()
                .query::<Option<()>>(con)
                .map(|applied| applied.map(|()| true))
        })
        .map_err(unavailable)
    }
}
