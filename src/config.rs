//! Configuration types for world connections

use serde::{Deserialize, Serialize};

/// Main configuration for a [`WorldConnection`](crate::world::WorldConnection)
///
/// One snapshot is taken at join time and shared by every peer session the
/// world creates; cadence constants are not runtime-tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// World identifier, used only for logging and diagnostics
    pub world_id: String,

    /// Local peer ID (auto-generated if None)
    pub peer_id: Option<String>,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Maximum peers in mesh (default: 10, max: 10)
    pub max_peers: u32,

    /// Cadence of positional audio refresh per connected peer (default: 100ms)
    pub audio_update_interval_ms: u64,

    /// Fallback world-state capture cadence, used when the time authority
    /// does not supply one (default: 50ms)
    pub capture_interval_ms: f64,

    /// Deadline for a session to reach a ready transport before the single
    /// automatic re-offer, and again before it fails (default: 30s)
    pub negotiation_timeout_ms: u64,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            world_id: "default".to_string(),
            peer_id: None,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            max_peers: 10,
            audio_update_interval_ms: 100,
            capture_interval_ms: 50.0,
            negotiation_timeout_ms: 30_000,
        }
    }
}

impl WorldConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - `max_peers` is not in range 1-10
    /// - `audio_update_interval_ms` is zero
    /// - `capture_interval_ms` is not positive
    /// - `negotiation_timeout_ms` is zero
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.max_peers == 0 || self.max_peers > 10 {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-10, got {}",
                self.max_peers
            )));
        }

        if self.audio_update_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "audio_update_interval_ms must be non-zero".to_string(),
            ));
        }

        if self.capture_interval_ms <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "capture_interval_ms must be positive, got {}",
                self.capture_interval_ms
            )));
        }

        if self.negotiation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "negotiation_timeout_ms must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
