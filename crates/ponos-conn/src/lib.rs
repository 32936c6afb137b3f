//! ponos-conn: resilient control connections to performers.
//!
//! A [`ConnectionManager`] owns the control channel to exactly one
//! performer endpoint. It reconnects with exponential backoff, confirms
//! readiness before handing a channel out, and derives a circuit breaker
//! from its recent failure history.
//!
//! Channels come from a [`Connector`]: [`HttpConnector`] speaks HTTP/2 to
//! real performers, [`LoopbackConnector`] serves simulated performers
//! in-process.

pub mod backoff;
pub mod circuit;
pub mod error;
pub mod http;
pub mod loopback;
pub mod manager;
pub mod transport;

pub use backoff::RetryPolicy;
pub use circuit::CircuitState;
pub use error::{ConnError, ConnResult};
pub use http::HttpConnector;
pub use loopback::LoopbackConnector;
pub use manager::ConnectionManager;
pub use transport::{ChannelState, Connector, PerformerChannel};
