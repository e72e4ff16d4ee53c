use std::time::{Duration, Instant};

use redis::Value::Okay;
use redis::{Client, Connection, IntoConnectionInfo, Value};

use super::{ttl_millis, LockStore};
use crate::error::StoreError;

const UNLOCK_SCRIPT: &str = r"if redis.call('get',KEYS[1]) == ARGV[1] then
                                return redis.call('del',KEYS[1])
                              else
                                return 0
                              end";

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);
/// Sockets reject a zero timeout, and anything shorter cannot complete a
/// round trip anyway.
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(10);
const MAX_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// [`LockStore`] backed by a single Redis instance.
///
/// Opens a connection per operation, so a store that went away and came
/// back is picked up on the next attempt. Connecting, sending and reading
/// together take at most the I/O timeout (1s unless set with
/// [`with_timeout`](Self::with_timeout)); a server that accepts the
/// connection but never answers is reported as unavailable.
///
/// URIs carrying a password or a database index make the client run a
/// handshake while connecting, which only the connect timeout covers.
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Client,
    unlock: redis::Script,
    io_timeout: Duration,
}

impl RedisStore {
    /// Create a store from a connection uri such as `"redis://127.0.0.1:6379"`.
    ///
    /// Only the uri is parsed here; nothing is contacted until the first
    /// lock operation.
    pub fn open<T: IntoConnectionInfo>(uri: T) -> Result<RedisStore, StoreError> {
        Ok(Self::with_client(Client::open(uri)?))
    }

    pub fn with_client(client: Client) -> RedisStore {
        RedisStore {
            client,
            unlock: redis::Script::new(UNLOCK_SCRIPT),
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Bound every store operation to `timeout`, clamped to 10ms..=60s.
    pub fn with_timeout(mut self, timeout: Duration) -> RedisStore {
        self.io_timeout = timeout.clamp(MIN_IO_TIMEOUT, MAX_IO_TIMEOUT);
        self
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Connect with the remaining socket operations bounded by the same
    /// deadline as the connect itself.
    fn connect(&self, timeout: Duration) -> Result<Connection, StoreError> {
        let deadline = Instant::now() + timeout;
        let conn = self.client.get_connection_with_timeout(timeout)?;

        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .max(MIN_IO_TIMEOUT);
        conn.set_read_timeout(Some(remaining))?;
        conn.set_write_timeout(Some(remaining))?;
        Ok(conn)
    }

    fn set_nx_px(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connect(timeout)?;
        let result = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query::<Value>(&mut conn)?;
        Ok(matches!(result, Okay))
    }
}

impl LockStore for RedisStore {
    fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.set_nx_px(key, value, ttl, self.io_timeout)
    }

    fn set_if_absent_within(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        budget: Duration,
    ) -> Result<bool, StoreError> {
        let timeout = self.io_timeout.min(budget).max(MIN_IO_TIMEOUT);
        self.set_nx_px(key, value, ttl, timeout)
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.connect(self.io_timeout)?;
        let deleted: i64 = self.unlock.key(key).arg(expected).invoke(&mut conn)?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AcquireError, Lock, LockOptions};
    use anyhow::Result;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Address of a server that accepts connections and never answers.
    fn silent_server() -> Result<String> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        thread::spawn(move || {
            let mut open = Vec::new();
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => open.push(stream),
                    Err(_) => break,
                }
            }
        });
        Ok(format!("redis://{}", addr))
    }

    #[test]
    fn test_open_rejects_bad_uri() {
        assert!(RedisStore::open("not a uri").is_err());
    }

    #[test]
    fn test_timeout_is_clamped() -> Result<()> {
        let store = RedisStore::open("redis://127.0.0.1:6379")?;
        assert_eq!(DEFAULT_IO_TIMEOUT, store.io_timeout());
        assert_eq!(MIN_IO_TIMEOUT, store.clone().with_timeout(Duration::ZERO).io_timeout());
        assert_eq!(MAX_IO_TIMEOUT, store.with_timeout(Duration::MAX).io_timeout());
        Ok(())
    }

    #[test]
    fn test_unreachable_store_is_unavailable() -> Result<()> {
        let store = RedisStore::open("redis://nonexistent")?;
        let err = store
            .set_if_absent_with_expiry("key", "token", Duration::from_secs(1))
            .expect_err("nothing listens on that host");
        assert!(err.is_unavailable());

        let err = store
            .compare_and_delete("key", "token")
            .expect_err("nothing listens on that host");
        assert!(err.is_unavailable());
        Ok(())
    }

    #[test]
    fn test_silent_server_times_out() -> Result<()> {
        let store = RedisStore::open(silent_server()?)?.with_timeout(Duration::from_millis(100));

        let start = Instant::now();
        let err = store
            .set_if_absent_with_expiry("key", "token", Duration::from_secs(1))
            .expect_err("the server never answers");
        assert!(err.is_unavailable(), "error: {}", err);

        let err = store
            .compare_and_delete("key", "token")
            .expect_err("the server never answers");
        assert!(err.is_unavailable(), "error: {}", err);
        assert!(start.elapsed() < Duration::from_secs(2), "elapsed: {:?}", start.elapsed());
        Ok(())
    }

    #[test]
    fn test_acquire_against_silent_server_honors_timeout() -> Result<()> {
        let store = RedisStore::open(silent_server()?)?;
        let opts = LockOptions::new(Duration::from_secs(10), Duration::from_millis(100))?;
        let mut lock = Lock::new(store, "res", opts)?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let result = lock.try_acquire();
            let _ = tx.send(matches!(result, Err(AcquireError::StoreUnavailable { .. })));
        });

        let unavailable = rx.recv_timeout(Duration::from_secs(3))?;
        assert!(unavailable, "expected the acquire to fail as store unavailable");
        Ok(())
    }
}

#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use crate::token;
    use anyhow::Result;
    use testcontainers::core::IntoContainerPort;
    use testcontainers::runners::AsyncRunner;
    use testcontainers::{ContainerAsync, GenericImage};

    async fn init() -> Result<(Option<ContainerAsync<GenericImage>>, String)> {
        match std::env::var("ADDRESS") {
            Ok(address) => Ok((None, address)),
            _ => {
                let container = GenericImage::new("redis", "7-alpine")
                    .with_exposed_port(6379.tcp())
                    .start()
                    .await?;
                let address = format!(
                    "redis://localhost:{}",
                    container.get_host_port_ipv4(6379).await?
                );
                Ok((Some(container), address))
            }
        }
    }

    #[tokio::test]
    async fn test_set_if_absent_only_once() -> Result<()> {
        let (_container, address) = init().await?;
        let store = RedisStore::open(address)?;
        let key = token::generate();

        assert!(store.set_if_absent_with_expiry(&key, "a", Duration::from_secs(10))?);
        assert!(!store.set_if_absent_with_expiry(&key, "b", Duration::from_secs(10))?);

        let mut con = store.client().get_connection()?;
        let value: String = redis::cmd("GET").arg(&key).query(&mut con)?;
        assert_eq!("a", value);
        let pttl: i64 = redis::cmd("PTTL").arg(&key).query(&mut con)?;
        assert!(pttl > 9000, "pttl: {}", pttl);
        Ok(())
    }

    #[tokio::test]
    async fn test_set_within_budget() -> Result<()> {
        let (_container, address) = init().await?;
        let store = RedisStore::open(address)?;
        let key = token::generate();

        let (ttl, budget) = (Duration::from_secs(10), Duration::from_millis(500));
        assert!(store.set_if_absent_within(&key, "a", ttl, budget)?);
        assert!(!store.set_if_absent_within(&key, "b", ttl, budget)?);
        assert!(store.compare_and_delete(&key, "a")?);
        Ok(())
    }

    #[tokio::test]
    async fn test_compare_and_delete_checks_value() -> Result<()> {
        let (_container, address) = init().await?;
        let store = RedisStore::open(address)?;
        let key = token::generate();

        assert!(!store.compare_and_delete(&key, "a")?);

        let mut con = store.client().get_connection()?;
        redis::cmd("SET").arg(&key).arg("a").exec(&mut con)?;

        assert!(!store.compare_and_delete(&key, "b")?);
        assert!(store.compare_and_delete(&key, "a")?);
        let exists: i64 = redis::cmd("EXISTS").arg(&key).query(&mut con)?;
        assert_eq!(0, exists);
        Ok(())
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() -> Result<()> {
        let (_container, address) = init().await?;
        let store = RedisStore::open(address)?;
        let key = token::generate();

        assert!(store.set_if_absent_with_expiry(&key, "a", Duration::from_millis(50))?);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.set_if_absent_with_expiry(&key, "b", Duration::from_secs(10))?);
        assert!(!store.compare_and_delete(&key, "a")?);
        assert!(store.compare_and_delete(&key, "b")?);
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_round_trip_against_redis() -> Result<()> {
        use crate::{Lock, LockOptions, ReleaseOutcome};

        let (_container, address) = init().await?;
        let store = RedisStore::open(address)?;
        let key = format!("ORDER:{}", token::generate());
        let opts = LockOptions::new(Duration::from_secs(90), Duration::from_millis(300))?;

        let mut a = Lock::new(&store, key.as_str(), opts)?;
        let mut b = Lock::new(&store, key.as_str(), opts)?;

        assert!(a.acquire());
        assert!(!b.acquire());
        assert_eq!(ReleaseOutcome::Released, a.release()?);
        assert!(b.acquire());
        assert_eq!(ReleaseOutcome::Released, b.release()?);
        Ok(())
    }
}
