//! Centralized security module for netguard.
//!
//! See [`netguard`] for the module overview, architecture diagram,
//! and public API documentation.

mod audit;
mod netguard;
mod policy;
mod rate_limit;
mod redact;
mod validator;

// The netguard.rs facade controls the entire public API surface.
pub use self::netguard::*;
