//! Trajectory input (spec §2 control flow: "Supervisor invokes Planner once
//! with trajectory data from the orchestrator"). The orchestrator
//! integration itself is out of scope (spec.md §1); this module is the
//! concrete boundary the core reads across — a JSON file supplied at a
//! configured path, following the read/parse shape of the teacher's
//! `persistence::load_state`.

use std::collections::HashMap;

use serde::Deserialize;
use tokio::fs;
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::geometry::Coordinate;
use crate::planner::TrajectorySet;

#[derive(Debug, Deserialize)]
struct TrajectoryInputFile {
    origin: Coordinate,
    trajectories: HashMap<String, Vec<Coordinate>>,
}

/// Read and parse the trajectory input file. Unlike session state, a
/// missing or malformed file here is a `ConfigError` (spec §7): the
/// Supervisor refuses to start rather than falling back to a default.
pub async fn load(path: &str) -> CoreResult<(Coordinate, TrajectorySet)> {
    let data = fs::read_to_string(path)
        .await
        .map_err(|e| CoreError::Config(format!("reading trajectory input {path}: {e}")))?;
    let parsed: TrajectoryInputFile = serde_json::from_str(&data)
        .map_err(|e| CoreError::Config(format!("parsing trajectory input {path}: {e}")))?;

    let mut trajectories = TrajectorySet::new();
    for (object_id, path) in parsed.trajectories {
        trajectories.insert(object_id, path);
    }
    info!(
        objects = trajectories.paths.len(),
        path, "loaded trajectory input"
    );
    Ok((parsed.origin, trajectories))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trajectory_input_file_parses_from_json() {
        let raw = serde_json::json!({
            "origin": {"lat": 57.7, "lng": 11.9, "alt": 0.0},
            "trajectories": {
                "v1": [{"lat": 57.7, "lng": 11.9, "alt": 0.0}],
            },
        });
        let parsed: TrajectoryInputFile = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.origin.lat, 57.7);
        assert_eq!(parsed.trajectories.len(), 1);
    }
}
