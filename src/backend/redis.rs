//! Remote key-value backend over Redis.
//!
//! Every mutation is a single server-side Lua script, so concurrent clients
//! in other processes or on other hosts can never interleave a read and a
//! write. Expiry is native (`PX`), which makes `purge_expired` a no-op.

use redis::{Client, Connection, IntoConnectionInfo, RedisResult, Script};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info};

use super::{Backend, BackendKind, DEFAULT_TIMEOUT};
use crate::error::{QuotaError, Result};

const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

// ARGV: expect_present ('1'/'0'), expected value, new value, ttl ms
const COMPARE_AND_SWAP_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
    if current ~= ARGV[2] then
        return 0
    end
elseif current then
    return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
";

/// Connection parameters for [`RedisBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct RedisSettings {
    /// Full connection URL; takes precedence over the discrete fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RedisSettings {
    pub fn from_url(url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            ..Self::default()
        }
    }

    pub fn connection_info(&self) -> Result<redis::ConnectionInfo> {
        match &self.url {
            Some(url) => Ok(url.as_str().into_connection_info()?),
            None => {
                let mut info = format!("redis://{}:{}/{}", self.host, self.port, self.db)
                    .into_connection_info()?;
                info.redis.password = self.password.clone();
                Ok(info)
            }
        }
    }
}

pub struct RedisBackend {
    client: Client,
    connection: Mutex<Option<Connection>>,
    timeout: Duration,
    increment: Script,
    compare_and_swap: Script,
}

impl RedisBackend {
    pub fn new(settings: &RedisSettings) -> Result<Self> {
        let client = Client::open(settings.connection_info()?)
            .map_err(|e| QuotaError::backend(format!("Failed to create Redis client: {}", e)))?;
        Ok(Self::from_client(client, settings.timeout))
    }

    /// Wraps a pre-built client. The connection is opened lazily.
    pub fn from_client(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            connection: Mutex::new(None),
            timeout,
            increment: Script::new(INCREMENT_SCRIPT),
            compare_and_swap: Script::new(COMPARE_AND_SWAP_SCRIPT),
        }
    }

    fn connect(&self) -> Result<Connection> {
        let conn = self
            .client
            .get_connection_with_timeout(self.timeout)
            .map_err(|e| QuotaError::backend(format!("Failed to connect to Redis: {}", e)))?;
        conn.set_read_timeout(Some(self.timeout))?;
        conn.set_write_timeout(Some(self.timeout))?;
        info!("Connected to Redis");
        Ok(conn)
    }

    fn with_connection<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut Connection) -> RedisResult<T>,
    ) -> Result<T> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| QuotaError::backend("Failed to acquire connection lock"))?;
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let conn = guard
            .as_mut()
            .ok_or_else(|| QuotaError::backend("No Redis connection available"))?;
        match f(conn) {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
                    // Reconnect on the next call.
                    *guard = None;
                }
                error!(op = op, error = %err, "Redis command failed");
                Err(QuotaError::backend(format!("redis {}: {}", op, err)))
            }
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl Backend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<u64> {
        self.with_connection("increment", |conn| {
            self.increment.key(key).arg(ttl_millis(ttl)).invoke(conn)
        })
    }

    fn read_counter(&self, key: &str) -> Result<Option<u64>> {
        self.with_connection("read_counter", |conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn read_structured(&self, key: &str) -> Result<Option<String>> {
        self.with_connection("read", |conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn write_structured(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.with_connection("write", |conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query(conn)
        })
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let swapped: i64 = self.with_connection("compare_and_swap", |conn| {
            self.compare_and_swap
                .key(key)
                .arg(if expected.is_some() { "1" } else { "0" })
                .arg(expected.unwrap_or(""))
                .arg(new)
                .arg(ttl_millis(ttl))
                .invoke(conn)
        })?;
        Ok(swapped == 1)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let removed: i64 =
            self.with_connection("delete", |conn| redis::cmd("DEL").arg(key).query(conn))?;
        Ok(removed > 0)
    }

    fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }

    fn ping(&self) -> Result<()> {
        let reply: String = self.with_connection("ping", |conn| redis::cmd("PING").query(conn))?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(QuotaError::backend(format!("unexpected PING reply: {}", reply)))
        }
    }
}
