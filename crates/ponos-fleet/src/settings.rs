//! The slice of the daemon configuration the fleet runs on.

use ponos_core::PonosConfig;
use ponos_core::config::{
    ConnectionSettings, DrainSettings, HealthSettings, LivenessSettings, PerformerSettings,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetSettings {
    pub connection: ConnectionSettings,
    pub health: HealthSettings,
    pub liveness: LivenessSettings,
    pub drain: DrainSettings,
    pub performer: PerformerSettings,
}

impl From<&PonosConfig> for FleetSettings {
    fn from(config: &PonosConfig) -> Self {
        Self {
            connection: config.connection.clone(),
            health: config.health.clone(),
            liveness: config.liveness.clone(),
            drain: config.drain.clone(),
            performer: config.performer.clone(),
        }
    }
}
