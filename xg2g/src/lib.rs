//! xg2g transcoding gateway.
//!
//! Turns playback intents for Enigma2 recordings and live channels into
//! supervised ffmpeg HLS sessions. The library is exposed for the binary
//! and for integration testing.

pub mod api;
pub mod config;
pub mod control;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod panic_hook;
pub mod receiver;
pub mod services;
pub mod session;
pub mod utils;

pub use error::{Error, Result};
