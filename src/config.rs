//! Server configuration
//!
//! Resolved from the command line and environment with sane defaults.

use std::env;

/// Default listen address
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Runtime configuration for the server binary
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the TCP listener binds to
    pub bind_addr: String,
}

impl Config {
    /// Resolve configuration: first CLI argument, then `CHAT_BIND_ADDR`,
    /// then the default.
    pub fn from_env() -> Self {
        Self::resolve(env::args().nth(1), env::var("CHAT_BIND_ADDR").ok())
    }

    fn resolve(arg: Option<String>, env_addr: Option<String>) -> Self {
        let bind_addr = arg
            .or(env_addr)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        Self { bind_addr }
    }
}
