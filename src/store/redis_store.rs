//! Redis-backed request log store.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use tracing::{debug, info};

use super::{RequestLogStore, StoreError};

/// Swap the value under KEYS[1] for ARGV[3] if it still matches what was read.
///
/// ARGV[1] is "1" when a value was read (held in ARGV[2]) and "0" when the
/// key was absent. Redis runs the whole script without interleaving.
const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

/// A request log store shared through a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    compare_and_swap: Script,
    url: String,
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;

        info!(url = %url, "Connected to Redis request log store");

        Ok(Self {
            connection,
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
            url: url.to_string(),
        })
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("url", &self.url).finish()
    }
}

#[async_trait]
impl RequestLogStore for RedisStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut connection = self.connection.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let (present, expected) = match expected {
            Some(bytes) => ("1", bytes),
            None => ("0", &b""[..]),
        };

        let swapped: i64 = self
            .compare_and_swap
            .key(key)
            .arg(present)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut connection)
            .await?;

        if swapped == 0 {
            debug!(key = %key, "Redis compare-and-swap lost to a concurrent writer");
        }
        Ok(swapped == 1)
    }
}
