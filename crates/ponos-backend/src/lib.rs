//! ponos-backend: the workload backends that materialize performers.
//!
//! A backend creates, starts, stops and removes compute units (containers,
//! pods, processes) and reports their liveness as a stream of lifecycle
//! events. The fleet controller only ever talks to the [`WorkloadBackend`]
//! trait; everything backend-specific stays behind it.
//!
//! # Variants
//!
//! ```text
//! WorkloadBackend
//!   ├── ProcessBackend  : one local child process per unit
//!   └── InMemoryBackend : simulated units for dry runs and tests
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod process;
pub mod unit;

pub use backend::{LifecycleEvents, WorkloadBackend};
pub use error::{BackendError, BackendResult};
pub use memory::{BackendCall, InMemoryBackend, Operation};
pub use process::ProcessBackend;
pub use unit::{LifecycleEvent, LifecycleKind, UnitId, UnitInfo, UnitSpec, UnitState};
