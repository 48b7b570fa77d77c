//! Runtime configuration, read entirely from the environment (spec §6.4).
//!
//! No command-line surface is part of the core contract; every field
//! follows the `VAR.ok().and_then(|v| v.parse().ok()).unwrap_or(default)`
//! shape used throughout the original UWB hub configuration.

use crate::error::{CoreError, CoreResult};

pub const ALTITUDE_MIN_M: f64 = 30.0;
pub const ALTITUDE_MAX_M: f64 = 99.0;
pub const FOV_DEGREES: f64 = 82.6;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_ip: String,
    pub listen_port: u16,
    pub cache_host: String,
    pub cache_port: u16,
    pub command_channel: String,
    pub position_ttl_seconds: u64,
    pub drone_count: usize,
    pub overlap: f64,
    pub trajectory_input_path: String,
}

impl Config {
    pub fn from_env() -> CoreResult<Self> {
        let listen_ip = std::env::var("LISTEN_IP").unwrap_or_else(|_| "0.0.0.0".to_string());
        let listen_port = std::env::var("LISTEN_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(14500);
        let cache_host = std::env::var("CACHE_HOST").unwrap_or_else(|_| "redis".to_string());
        let cache_port = std::env::var("CACHE_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(6379);
        let command_channel =
            std::env::var("COMMAND_CHANNEL").unwrap_or_else(|_| "drone_commands".to_string());
        let position_ttl_seconds = std::env::var("POSITION_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        let drone_count: usize = std::env::var("DRONE_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| CoreError::Config("DRONE_COUNT is required and must be >= 1".into()))?;
        let overlap: f64 = std::env::var("OVERLAP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.5);
        let trajectory_input_path =
            std::env::var("TRAJECTORY_INPUT_PATH").unwrap_or_else(|_| "trajectories.json".to_string());

        let config = Self {
            listen_ip,
            listen_port,
            cache_host,
            cache_port,
            command_channel,
            position_ttl_seconds,
            drone_count,
            overlap,
            trajectory_input_path,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> CoreResult<()> {
        if self.drone_count == 0 {
            return Err(CoreError::Config("drone_count must be >= 1".into()));
        }
        if !(0.0..=0.9).contains(&self.overlap) {
            return Err(CoreError::Config("overlap must be within [0, 0.9]".into()));
        }
        if self.drone_count >= 2 && self.overlap > 0.9 {
            return Err(CoreError::Config(
                "drone_count >= 2 with overlap > 0.9 is a proximity error".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(drone_count: usize, overlap: f64) -> Config {
        Config {
            listen_ip: "0.0.0.0".into(),
            listen_port: 14500,
            cache_host: "redis".into(),
            cache_port: 6379,
            command_channel: "drone_commands".into(),
            position_ttl_seconds: 60,
            drone_count,
            overlap,
            trajectory_input_path: "trajectories.json".into(),
        }
    }

    #[test]
    fn validate_rejects_zero_drones() {
        assert!(test_config(0, 0.5).validate().is_err());
    }

    #[test]
    fn validate_rejects_overlap_out_of_range() {
        assert!(test_config(1, 0.95).validate().is_err());
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(test_config(3, 0.5).validate().is_ok());
    }
}
