//! Transcoding session control plane.

pub mod admission;
pub mod breaker;
pub mod intent;
pub mod resolver;
pub mod supervisor;
pub mod watchdog;

pub use admission::{AdmissionClass, AdmissionConfig, AdmissionController, AdmissionTicket, PoolSnapshot};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use intent::{Intent, OutputProfile, TargetRef};
pub use resolver::{DurationStore, PathMapper, PathMapping, RecordingRef, RecordingsResolver, Resolver};
pub use supervisor::{SessionSupervisor, SupervisorConfig};
pub use watchdog::{Watchdog, WatchdogConfig};
