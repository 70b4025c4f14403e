//! Connection pool for the backing store
//!
//! Keeps a small free-list of multiplexed connections, each validated
//! with a lightweight `PING` before being handed out again, and
//! reconnects transparently when a probe fails. The pool is a resource
//! management detail only; the lock's fencing guarantees rest on the
//! atomicity of individual store commands, never on which connection
//! carried them.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tracing::debug;

use cofre_common::{CofreError, Result};

/// Idle connections kept beyond this count are closed on check-in.
pub const DEFAULT_MAX_IDLE: usize = 4;

/// Idle connections older than this are discarded rather than reused.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ConnectionPool {
    client: Client,
    idle: Mutex<Vec<IdleConn>>,
    max_idle: usize,
    idle_timeout: Duration,
}

struct IdleConn {
    conn: MultiplexedConnection,
    since: Instant,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // `MultiplexedConnection` is not `Debug`; report the idle count
        // instead of the connections themselves.
        f.debug_struct("ConnectionPool")
            .field("client", &self.client)
            .field("idle", &self.idle.lock().len())
            .field("max_idle", &self.max_idle)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl ConnectionPool {
    /// Build a pool descriptor for `url`. No network connection is opened
    /// until the first checkout.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|err| {
            CofreError::ConfigError(format!("invalid store url '{}': {}", url, err))
        })?;
        Ok(Self {
            client,
            idle: Mutex::new(Vec::new()),
            max_idle: DEFAULT_MAX_IDLE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    /// Check out a connection, preferring a validated idle one.
    pub async fn get(&self) -> Result<MultiplexedConnection> {
        loop {
            let candidate = self.idle.lock().pop();
            let Some(idle) = candidate else { break };
            if idle.since.elapsed() > self.idle_timeout {
                continue;
            }
            let mut conn = idle.conn;
            match redis::cmd("PING").query_async::<String>(&mut conn).await {
                Ok(_) => return Ok(conn),
                Err(err) => {
                    debug!(error = %err, "pooled connection failed liveness probe, discarding");
                }
            }
        }

        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| CofreError::StoreError(err.to_string()))
    }

    /// Return a connection after successful use. Stale or surplus idle
    /// connections are dropped here.
    pub fn put(&self, conn: MultiplexedConnection) {
        let mut idle = self.idle.lock();
        idle.retain(|c| c.since.elapsed() <= self.idle_timeout);
        if idle.len() < self.max_idle {
            idle.push(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
    }
}
