//! Signalling Server (spec §4.E): accepts WebSocket connections, assigns
//! each one a fly-to target, and demultiplexes inbound frames by
//! `msg_type`.
//!
//! Router/upgrade shape follows the teacher's `main.rs` axum assembly;
//! per-connection dispatch follows the shape of `handlers.rs::on_connect`,
//! adapted from socket.io events to a tagged-enum frame (`session::InboundFrame`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bridge::CommandMessage;
use crate::cache::{position_key, CacheAdapter, PositionRecord};
use crate::planner::FlyToTarget;
use crate::session::{InboundFrame, PeerSession};

/// Tracks which planner slots are currently claimed so new connections get
/// the first free target; once every slot is taken, new connections share
/// the last one (spec §4.E slot assignment, §9 open question).
struct SlotPool {
    targets: Vec<FlyToTarget>,
    claims: Vec<usize>,
}

impl SlotPool {
    fn new(targets: Vec<FlyToTarget>) -> Self {
        let claims = vec![0; targets.len().max(1)];
        Self { targets, claims }
    }

    fn assign(&mut self) -> Option<(usize, FlyToTarget)> {
        if self.targets.is_empty() {
            return None;
        }
        let free = self.claims.iter().position(|&n| n == 0);
        let slot = free.unwrap_or(self.targets.len() - 1);
        if free.is_none() {
            warn!(slot, "no free fly-to target, sharing the last slot as fallback");
        }
        self.claims[slot] += 1;
        Some((slot, self.targets[slot]))
    }

    fn release(&mut self, slot: usize) {
        if let Some(count) = self.claims.get_mut(slot) {
            *count = count.saturating_sub(1);
        }
    }
}

struct Inner {
    slots: Mutex<SlotPool>,
    /// Live sessions keyed by connection id.
    connections: Mutex<HashMap<String, Arc<Mutex<PeerSession>>>>,
    /// Connect-order snapshot used for index-based command addressing
    /// (spec §9): `order[target_drone_id - 1]` when no `Identify` binding
    /// exists for that slot.
    order: Mutex<Vec<String>>,
    /// `Identify`-declared drone id -> connection id (spec §9, preferred
    /// over index-based addressing when present).
    stable_ids: Mutex<HashMap<String, String>>,
    cache: CacheAdapter,
    position_ttl: Duration,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl AppState {
    pub fn new(targets: Vec<FlyToTarget>, cache: CacheAdapter, position_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(SlotPool::new(targets)),
                connections: Mutex::new(HashMap::new()),
                order: Mutex::new(Vec::new()),
                stable_ids: Mutex::new(HashMap::new()),
                cache,
                position_ttl,
            }),
        }
    }

    /// Resolve a command's target into a live session, preferring a
    /// stable-id match over positional indexing (spec §9).
    async fn resolve(&self, cmd: &CommandMessage) -> Option<Arc<Mutex<PeerSession>>> {
        let connection_id = {
            let stable_ids = self.inner.stable_ids.lock().await;
            let order = self.inner.order.lock().await;
            resolve_connection_id(&stable_ids, &order, cmd.target_drone_id)?
        };
        self.inner.connections.lock().await.get(&connection_id).cloned()
    }

    /// Apply one command pulled off the bridge channel.
    pub async fn dispatch_command(&self, cmd: CommandMessage) {
        match self.resolve(&cmd).await {
            Some(session) => {
                let session = session.lock().await;
                session.send_command(&cmd.command, cmd.payload).await;
            }
            None => warn!(target_drone_id = cmd.target_drone_id, command = %cmd.command, "command addressed no live session"),
        }
    }

    /// Close every live session (spec §4.E graceful shutdown).
    pub async fn shutdown(&self) {
        let mut connections = self.inner.connections.lock().await;
        for session in connections.values() {
            session.lock().await.close("server cleanup").await;
        }
        connections.clear();
        self.inner.order.lock().await.clear();
        self.inner.stable_ids.lock().await.clear();
    }
}

pub fn router(state: AppState, command_rx: mpsc::UnboundedReceiver<CommandMessage>) -> Router {
    tokio::spawn(run_command_loop(state.clone(), command_rx));

    Router::new()
        .route("/", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn run_command_loop(state: AppState, mut rx: mpsc::UnboundedReceiver<CommandMessage>) {
    while let Some(cmd) = rx.recv().await {
        state.dispatch_command(cmd).await;
    }
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    let (sink, mut stream) = socket.split();

    let (slot, target) = {
        let mut slots = state.inner.slots.lock().await;
        match slots.assign() {
            Some((slot, target)) => (Some(slot), Some(target)),
            None => (None, None),
        }
    };

    info!(connection_id = %connection_id, slot = ?slot, "peer connected");

    let session = Arc::new(Mutex::new(PeerSession::new(connection_id.clone(), sink, target)));
    {
        let mut connections = state.inner.connections.lock().await;
        connections.insert(connection_id.clone(), session.clone());
        state.inner.order.lock().await.push(connection_id.clone());
    }

    session.lock().await.send_assigned_coordinate().await;

    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                warn!(connection_id = %connection_id, "websocket error: {e}");
                break;
            }
        };
        match message {
            Message::Text(text) => handle_frame(&state, &connection_id, &session, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    drop_connection(&state, &connection_id, slot).await;
}

async fn handle_frame(state: &AppState, connection_id: &str, session: &Arc<Mutex<PeerSession>>, text: &str) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection_id, "malformed or unknown frame dropped: {e}");
            return;
        }
    };

    match frame {
        InboundFrame::CoordinateRequest => {
            session.lock().await.send_assigned_coordinate().await;
        }
        InboundFrame::Position {
            latitude,
            longitude,
            altitude,
            timestamp,
        } => {
            let record = PositionRecord {
                connection_id: connection_id.to_string(),
                latitude,
                longitude,
                altitude,
                timestamp: timestamp.unwrap_or(0),
            };
            if let Ok(bytes) = serde_json::to_vec(&record) {
                let key = position_key(connection_id);
                if let Err(e) = state.inner.cache.put(&key, &bytes, state.inner.position_ttl).await {
                    warn!(connection_id, "failed to persist position: {e}");
                }
            }
        }
        InboundFrame::Debug { msg } => {
            tracing::debug!(connection_id, "client debug: {msg}");
        }
        InboundFrame::Offer { sdp, .. } => {
            session.lock().await.handle_offer(sdp).await;
        }
        InboundFrame::Candidate { candidate } => {
            session.lock().await.handle_candidate(candidate).await;
        }
        InboundFrame::Answer { .. } => {
            warn!(connection_id, "unexpected answer from client, ignoring");
        }
        InboundFrame::Identify { drone_id } => {
            session.lock().await.stable_id = Some(drone_id.clone());
            state.inner.stable_ids.lock().await.insert(drone_id, connection_id.to_string());
        }
    }
}

async fn drop_connection(state: &AppState, connection_id: &str, slot: Option<usize>) {
    let removed = state.inner.connections.lock().await.remove(connection_id);
    if let Some(session) = removed {
        session.lock().await.close("connection lost").await;
    }
    if let Some(slot) = slot {
        state.inner.slots.lock().await.release(slot);
    }
    state.inner.order.lock().await.retain(|id| id != connection_id);
    state.inner.stable_ids.lock().await.retain(|_, v| v != connection_id);
    info!(connection_id, "peer disconnected");
}

/// Pure command-addressing lookup (spec §9): prefer a stable-id match,
/// else fall back to the 1-based connect-order index.
fn resolve_connection_id(stable_ids: &HashMap<String, String>, order: &[String], target_drone_id: u32) -> Option<String> {
    let key = target_drone_id.to_string();
    if let Some(connection_id) = stable_ids.get(&key) {
        return Some(connection_id.clone());
    }
    let index = (target_drone_id as usize).checked_sub(1)?;
    order.get(index).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Coordinate;

    fn target(lat: f64) -> FlyToTarget {
        FlyToTarget {
            coordinate: Coordinate::new(lat, 0.0, 50.0),
            yaw_deg: 0.0,
        }
    }

    #[test]
    fn slot_pool_assigns_first_free_slot() {
        let mut pool = SlotPool::new(vec![target(1.0), target(2.0)]);
        let (slot, _) = pool.assign().unwrap();
        assert_eq!(slot, 0);
        let (slot, _) = pool.assign().unwrap();
        assert_eq!(slot, 1);
    }

    #[test]
    fn slot_pool_falls_back_to_last_slot_once_all_claimed() {
        let mut pool = SlotPool::new(vec![target(1.0), target(2.0)]);
        pool.assign().unwrap();
        pool.assign().unwrap();
        let (slot, _) = pool.assign().unwrap();
        assert_eq!(slot, 1);
    }

    #[test]
    fn slot_pool_reclaims_a_released_slot() {
        let mut pool = SlotPool::new(vec![target(1.0), target(2.0)]);
        let (first, _) = pool.assign().unwrap();
        pool.assign().unwrap();
        pool.release(first);
        let (reassigned, _) = pool.assign().unwrap();
        assert_eq!(reassigned, first);
    }

    #[test]
    fn slot_pool_with_no_targets_assigns_nothing() {
        let mut pool = SlotPool::new(vec![]);
        assert!(pool.assign().is_none());
    }

    #[test]
    fn resolve_prefers_stable_id_over_index() {
        let mut stable_ids = HashMap::new();
        stable_ids.insert("2".to_string(), "conn-b".to_string());
        let order = vec!["conn-a".to_string(), "conn-b".to_string()];

        let resolved = resolve_connection_id(&stable_ids, &order, 2);
        assert_eq!(resolved.as_deref(), Some("conn-b"));
    }

    #[test]
    fn resolve_falls_back_to_connect_order_index() {
        let stable_ids = HashMap::new();
        let order = vec!["conn-a".to_string(), "conn-b".to_string()];

        let resolved = resolve_connection_id(&stable_ids, &order, 2);
        assert_eq!(resolved.as_deref(), Some("conn-b"));
    }

    #[test]
    fn resolve_returns_none_for_out_of_range_index() {
        let stable_ids = HashMap::new();
        let order = vec!["conn-a".to_string()];

        assert!(resolve_connection_id(&stable_ids, &order, 5).is_none());
    }

    #[test]
    fn resolve_returns_none_for_target_drone_id_zero() {
        let stable_ids = HashMap::new();
        let order = vec!["conn-a".to_string()];

        assert!(resolve_connection_id(&stable_ids, &order, 0).is_none());
    }
}
