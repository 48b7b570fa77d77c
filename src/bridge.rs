//! Command Bridge (spec §4.F): a dedicated OS thread that drives the
//! blocking cache subscription and hands parsed commands to the server's
//! cooperative event loop.
//!
//! Mirrors the hand-off shape of the teacher's `uwb_hub::start_uwb_hub` —
//! a listener that never touches shared session state directly, instead
//! forwarding parsed events through a channel for the async side to apply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{de::Error as _, Deserialize, Deserializer};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::CacheAdapter;

/// A command as it arrives on the wire (spec §6.2). `target_drone_id` is
/// 1-based, matching the fallback index addressing described in spec §9.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandMessage {
    #[serde(deserialize_with = "coerce_target_drone_id")]
    pub target_drone_id: u32,
    pub command: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Coerce `target_drone_id` to an integer >= 1 (spec §4.F step 1: "coerce
/// to integer >= 1"), accepting a JSON number (`2`, `2.0`) or numeric
/// string (`"2"`) rather than requiring a strict integer.
fn coerce_target_drone_id<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let n: f64 = match &value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| D::Error::custom(format!("target_drone_id {n} is not numeric")))?,
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("target_drone_id {s:?} is not numeric")))?,
        other => return Err(D::Error::custom(format!("target_drone_id has unsupported type: {other}"))),
    };
    let n = n.round();
    if n < 1.0 {
        return Err(D::Error::custom("target_drone_id must be >= 1"));
    }
    Ok(n as u32)
}

/// Handle to the running bridge thread. Dropping this without calling
/// [`CommandBridge::shutdown`] leaves the thread running — shutdown is
/// explicit, not tied to the handle's lifetime.
pub struct CommandBridge {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl CommandBridge {
    /// Spawn the bridge thread. `cache` is cloned onto the new thread;
    /// cloning shares the lazily-established connection manager used by
    /// the rest of the process, but the blocking subscription itself opens
    /// its own synchronous connection (spec §4.C).
    pub fn start(cache: CacheAdapter, channel: String, tx: mpsc::UnboundedSender<CommandMessage>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();

        let handle = std::thread::Builder::new()
            .name("command-bridge".to_string())
            .spawn(move || {
                cache.subscribe_blocking(&channel, &stop_thread, |payload| {
                    match serde_json::from_str::<CommandMessage>(&payload) {
                        Ok(cmd) => {
                            if tx.send(cmd).is_err() {
                                warn!("command bridge: server loop gone, dropping command");
                            }
                        }
                        Err(e) => warn!("command bridge: malformed command payload dropped: {e}"),
                    }
                });
            })
            .expect("spawning the command-bridge thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the subscription to stop and join the thread. Blocks for at
    /// most one read-timeout interval (spec §4.C, 500ms) plus any
    /// in-flight reconnect backoff.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_message_parses_minimal_payload() {
        let raw = serde_json::json!({"target_drone_id": 2, "command": "land"});
        let cmd: CommandMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(cmd.target_drone_id, 2);
        assert_eq!(cmd.command, "land");
        assert!(cmd.timestamp.is_none());
    }

    #[test]
    fn command_message_parses_with_payload_and_timestamp() {
        let raw = serde_json::json!({
            "target_drone_id": 1,
            "command": "set_speed",
            "payload": {"mps": 3.5},
            "timestamp": 1_700_000_000,
        });
        let cmd: CommandMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(cmd.payload["mps"], 3.5);
        assert_eq!(cmd.timestamp, Some(1_700_000_000));
    }

    #[test]
    fn command_message_coerces_string_target_drone_id() {
        let raw = serde_json::json!({"target_drone_id": "2", "command": "land"});
        let cmd: CommandMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(cmd.target_drone_id, 2);
    }

    #[test]
    fn command_message_coerces_float_target_drone_id() {
        let raw = serde_json::json!({"target_drone_id": 2.0, "command": "land"});
        let cmd: CommandMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(cmd.target_drone_id, 2);
    }

    #[test]
    fn command_message_rejects_target_drone_id_below_one() {
        let raw = serde_json::json!({"target_drone_id": 0, "command": "land"});
        let result: Result<CommandMessage, _> = serde_json::from_value(raw);
        assert!(result.is_err());
    }
}
