//! netguard - a security gatekeeper between natural-language network
//! automation and real devices.
//!
//! This crate provides:
//! - Input screening for prompt-injection attempts
//! - A read-only command policy with pipe and chaining rules
//! - Redaction of credentials and keys in device output
//! - Sliding-window rate limiting
//! - A self-healing device session with liveness probing
//! - A hash-chained audit log of every security decision

pub mod cli;
pub mod config;
pub mod device;
pub mod gatekeeper;
pub mod paths;
pub mod security;
pub mod tools;

pub use config::Config;
pub use gatekeeper::{GateError, Gatekeeper};
