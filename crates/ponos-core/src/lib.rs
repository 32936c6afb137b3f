//! ponos-core: shared types and configuration for the Ponos performer
//! fleet controller.
//!
//! Everything here is plain data: tenant and performer identifiers, image
//! references, slot and health records, status events, the task wire types
//! spoken to performers, and the typed `ponos.toml` configuration.

pub mod config;
pub mod duration;
pub mod types;

pub use config::PonosConfig;
pub use duration::parse_duration;
pub use types::*;
