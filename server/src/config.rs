//! Server tunables shared by the binary and the library entry points.

use std::time::Duration;

use crate::client_manager::{SessionId, DEFAULT_ID_CEILING};
use crate::moderation::DEFAULT_FILTER_URL;
use crate::world::WorldConfig;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Primary tick: flag physics, leases, snapshot broadcast
    pub frame_period: Duration,
    pub secondary_period: Duration,
    /// Roster broadcast and chat cooldown countdown
    pub roster_period: Duration,
    /// Skin broadcast
    pub cosmetic_period: Duration,
    pub moderation_url: String,
    pub moderation_timeout: Duration,
    pub id_ceiling: SessionId,
    pub handshake_ticks: Option<u32>,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn world(&self) -> WorldConfig {
        WorldConfig {
            id_ceiling: self.id_ceiling,
            handshake_ticks: self.handshake_ticks,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            frame_period: Duration::from_millis(33),
            secondary_period: Duration::from_millis(66),
            roster_period: Duration::from_millis(1000),
            cosmetic_period: Duration::from_millis(10_000),
            moderation_url: DEFAULT_FILTER_URL.to_string(),
            moderation_timeout: Duration::from_millis(5000),
            id_ceiling: DEFAULT_ID_CEILING,
            handshake_ticks: None,
        }
    }
}
