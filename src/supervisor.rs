//! Supervisor (spec §4.G): brings components up in order — Coordinate
//! service, Planner, Shared Cache Adapter, Server, Command Bridge — and
//! tears them down in reverse. Idempotent.
//!
//! Mirrors the teacher's `main.rs`, which sequences background tasks
//! (auth refresh, audit logger, UWB hub, engine tick, auto director) around
//! a shared router before serving; here the sequencing is explicit because
//! a cache-unreachable startup must abort before the server ever binds.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

use crate::bridge::CommandBridge;
use crate::cache::CacheAdapter;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::input;
use crate::planner::{self, PlannerInput};
use crate::server;

/// Run the core to completion: bring every component up, serve until a
/// shutdown signal arrives, then tear everything down in reverse order.
pub async fn run(config: Config) -> CoreResult<()> {
    // Coordinate service (spec §4.B) is pure; nothing to initialise.

    let (origin, trajectories) = input::load(&config.trajectory_input_path).await?;

    let planner_input = PlannerInput {
        trajectories,
        origin,
        drone_count: config.drone_count,
        overlap: config.overlap,
        fov_degrees: crate::config::FOV_DEGREES,
        altitude_min_m: crate::config::ALTITUDE_MIN_M,
        altitude_max_m: crate::config::ALTITUDE_MAX_M,
    };
    let planner_output = planner::plan(planner_input)?;
    info!(targets = planner_output.targets.len(), "planner produced fly-to targets");

    let cache = CacheAdapter::new(&config.cache_host, config.cache_port)?;
    cache.connect().await.map_err(|e| {
        CoreError::Fatal(format!(
            "shared cache unreachable at {}:{}: {e}",
            config.cache_host, config.cache_port
        ))
    })?;
    info!(host = %config.cache_host, port = config.cache_port, "cache adapter connected");

    let state = server::AppState::new(
        planner_output.targets,
        cache.clone(),
        Duration::from_secs(config.position_ttl_seconds),
    );

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let bridge = CommandBridge::start(cache, config.command_channel.clone(), command_tx);

    let router = server::router(state.clone(), command_rx);
    let addr = format!("{}:{}", config.listen_ip, config.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| CoreError::Fatal(format!("binding {addr}: {e}")))?;
    info!(%addr, "signalling server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| CoreError::Fatal(format!("server loop exited: {e}")))?;

    info!("shutting down");
    state.shutdown().await;
    bridge.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
