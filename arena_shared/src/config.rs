//! Configuration system.
//!
//! Loads arena configuration from JSON strings/files (file IO left to app).
//! Every field has a default so a partial file only overrides what it names.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Server listen address, e.g. `0.0.0.0:40000`.
    pub server_addr: String,
    /// Seconds between simulation steps (and snapshot broadcasts).
    pub update_interval_secs: f32,
    /// Upper bound on one network poll wait, in milliseconds.
    pub poll_timeout_ms: u64,
    /// Connections beyond this count are rejected.
    pub max_clients: usize,
    /// Capacity of each client link queue.
    pub link_queue_capacity: usize,
    /// Simulation tuning.
    pub sim: SimConfig,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            update_interval_secs: 0.03,
            poll_timeout_ms: 2,
            max_clients: 16,
            link_queue_capacity: 1024,
            sim: SimConfig::default(),
        }
    }
}

/// Well-known server port.
pub const DEFAULT_PORT: u16 = 40000;

impl ArenaConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs_f32(self.update_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server_addr
            .parse()
            .map_err(|_| ConfigError::Address(self.server_addr.clone()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.update_interval_secs.is_finite() && self.update_interval_secs > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "update_interval_secs must be positive, got {}",
                self.update_interval_secs
            )));
        }
        if self.link_queue_capacity == 0 {
            return Err(ConfigError::Invalid("link_queue_capacity must be > 0".into()));
        }
        self.socket_addr()?;
        self.sim.validate()
    }
}

/// Simulation constants. Units are world units and seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub entity_capacity: usize,
    pub history_depth: usize,
    /// The world spans `[-half_width, half_width] x [-half_height, half_height]`.
    pub half_width: f32,
    pub half_height: f32,
    pub min_stars: usize,
    pub trap_count: usize,
    pub trap_diameter: f32,
    pub trap_speed: f32,
    pub player_diameter: f32,
    pub player_speed: f32,
    pub bullet_diameter: f32,
    pub bullet_speed: f32,
    pub bullet_lifetime: f32,
    /// Local rewind applied to a player hit by a bullet.
    pub bullet_hit_rewind: f32,
    /// Local rewind applied to both players of a bump.
    pub player_bump_rewind: f32,
    pub drain_interval: f32,
    pub drain_factor: f32,
    pub drained_star_speed: f32,
    pub drained_star_lifetime: f32,
    /// Drained stars at or below this diameter are not spawned.
    pub min_drain_star_diameter: f32,
    /// Round length; 0 disables the round timer.
    pub round_secs: f32,
    /// Minimum seconds between accepted shots; 0 trusts the client cooldown.
    pub shoot_cooldown_secs: f32,
    /// Fixed RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            entity_capacity: 756,
            history_depth: 500,
            half_width: 800.0,
            half_height: 600.0,
            min_stars: 60,
            trap_count: 10,
            trap_diameter: 150.0,
            trap_speed: 150.0,
            player_diameter: 70.0,
            player_speed: 100.0,
            bullet_diameter: 10.0,
            bullet_speed: 300.0,
            bullet_lifetime: 2.0,
            bullet_hit_rewind: 2.0,
            player_bump_rewind: 0.3,
            drain_interval: 0.1,
            drain_factor: 0.1,
            drained_star_speed: 110.0,
            drained_star_lifetime: 8.0,
            min_drain_star_diameter: 2.0,
            round_secs: 300.0,
            shoot_cooldown_secs: 0.0,
            seed: None,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entity_capacity == 0 {
            return Err(ConfigError::Invalid("entity_capacity must be > 0".into()));
        }
        if self.history_depth < 3 {
            return Err(ConfigError::Invalid(format!(
                "history_depth must be at least 3, got {}",
                self.history_depth
            )));
        }
        if !(self.half_width > 0.0 && self.half_height > 0.0) {
            return Err(ConfigError::Invalid("world extents must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.drain_factor) {
            return Err(ConfigError::Invalid(format!(
                "drain_factor must be within [0, 1], got {}",
                self.drain_factor
            )));
        }
        if self.round_secs < 0.0 || self.shoot_cooldown_secs < 0.0 {
            return Err(ConfigError::Invalid("durations must not be negative".into()));
        }
        Ok(())
    }
}
