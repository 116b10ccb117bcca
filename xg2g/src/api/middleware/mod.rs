//! API middleware.

pub mod auth;

pub use auth::{ApiToken, Principal, Scope, TokenAuth, token_auth};
