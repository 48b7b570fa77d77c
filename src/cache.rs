//! Shared Cache Adapter (spec §4.C): typed put/get of short-lived keys and
//! a blocking pub/sub subscription, backed by Redis.
//!
//! Connections are established lazily; on transport error the adapter
//! retries with a fixed 5-second backoff (spec §4.C, §7 TransportError).
//! `subscribe` opens a connection distinct from the one used for
//! put/get/ping — subscribe is long-lived and exclusive.

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

struct Inner {
    client: redis::Client,
    manager: tokio::sync::OnceCell<redis::aio::ConnectionManager>,
}

/// Cheaply cloneable handle onto a lazily-established connection manager.
/// Cloning shares the same underlying connection rather than opening a new
/// one, so the adapter can be handed to the server loop, the supervisor, and
/// the command bridge's OS thread alike.
#[derive(Clone)]
pub struct CacheAdapter {
    inner: Arc<Inner>,
}

impl CacheAdapter {
    pub fn new(host: &str, port: u16) -> CoreResult<Self> {
        let url = format!("redis://{host}:{port}");
        let client = redis::Client::open(url)
            .map_err(|e| CoreError::Transport(format!("invalid cache address: {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                manager: tokio::sync::OnceCell::new(),
            }),
        })
    }

    async fn manager(&self) -> CoreResult<redis::aio::ConnectionManager> {
        let manager = self
            .inner
            .manager
            .get_or_try_init(|| async {
                self.inner
                    .client
                    .get_connection_manager()
                    .await
                    .map_err(|e| CoreError::Transport(format!("connect failed: {e}")))
            })
            .await?;
        Ok(manager.clone())
    }

    /// Connect eagerly (used at startup — spec §7: cache unreachable at
    /// startup is Fatal and causes the supervisor to refuse to start).
    pub async fn connect(&self) -> CoreResult<()> {
        self.manager().await?;
        Ok(())
    }

    pub async fn ping(&self) -> CoreResult<()> {
        let mut conn = self.manager().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::Transport(format!("ping failed: {e}")))?;
        Ok(())
    }

    /// `put(key, value, ttl)` — TTL is mandatory so dead sessions cannot
    /// leak entries (spec §3, §5 shared-resource policy).
    pub async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> CoreResult<()> {
        let mut conn = self.manager().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| CoreError::Transport(format!("put failed: {e}")))
    }

    pub async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let mut conn = self.manager().await?;
        conn.get(key)
            .await
            .map_err(|e| CoreError::Transport(format!("get failed: {e}")))
    }

    /// Blocking subscribe loop (spec §4.C `subscribe` — "blocking"): runs
    /// until `stop` is set, reconnecting with a 5-second backoff on any
    /// transport error. Uses the synchronous redis client on its own
    /// connection, distinct from the one used by `put`/`get`/`ping`, and is
    /// meant to be driven from a dedicated OS thread (spec §4.F), not a
    /// tokio task.
    pub fn subscribe_blocking<F>(&self, channel: &str, stop: &std::sync::atomic::AtomicBool, mut on_message: F)
    where
        F: FnMut(String),
    {
        use std::sync::atomic::Ordering;

        while !stop.load(Ordering::Relaxed) {
            let conn = match self.inner.client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!("cache subscribe: connect failed: {e}, retrying in 5s");
                    std::thread::sleep(RECONNECT_BACKOFF);
                    continue;
                }
            };

            let mut pubsub = conn.as_pubsub();
            pubsub.set_read_timeout(Some(Duration::from_millis(500))).ok();
            if let Err(e) = pubsub.subscribe(channel) {
                warn!("cache subscribe: subscribe to {channel} failed: {e}, retrying in 5s");
                std::thread::sleep(RECONNECT_BACKOFF);
                continue;
            }
            info!("cache subscribe: listening on {channel}");

            loop {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                match pubsub.get_message() {
                    Ok(msg) => match msg.get_payload::<String>() {
                        Ok(payload) => on_message(payload),
                        Err(e) => warn!("cache subscribe: non-utf8 payload dropped: {e}"),
                    },
                    Err(e) => {
                        // Read-timeout errors are expected; they just let us
                        // re-check `stop`. Anything else means the
                        // connection is dead and we must reconnect.
                        if e.is_timeout() {
                            continue;
                        }
                        warn!("cache subscribe: connection lost: {e}, retrying in 5s");
                        break;
                    }
                }
            }
            std::thread::sleep(RECONNECT_BACKOFF);
        }
    }
}

/// `drone_position:<connection_id>` payload (spec §3, §6.3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PositionRecord {
    pub connection_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub timestamp: i64,
}

pub fn position_key(connection_id: &str) -> String {
    format!("drone_position:{connection_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_key_matches_contract_shape() {
        assert_eq!(position_key("abc-123"), "drone_position:abc-123");
    }

    #[test]
    fn position_record_round_trips_through_json() {
        let record = PositionRecord {
            connection_id: "conn-1".into(),
            latitude: 57.7,
            longitude: 11.9,
            altitude: 42.0,
            timestamp: 1_000,
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: PositionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.connection_id, record.connection_id);
        assert!((parsed.latitude - record.latitude).abs() < 1e-12);
    }
}
