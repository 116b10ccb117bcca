//! Session lifecycle tracking.

pub mod evicter;
pub mod model;
pub mod store;

pub use evicter::{CacheEvicter, EvicterConfig, EvictionReport};
pub use model::{ProgressSnapshot, Session, SessionState};
pub use store::SessionStore;
