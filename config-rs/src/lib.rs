//! config-rs/lib.rs
//! Shared environment helpers for the prompt-evolution services.
//! Provides bind-address resolution and typed environment lookups.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

/// Load a `.env` file from the working directory if one exists.
///
/// Missing files are not an error; variables already present in the
/// process environment always win.
pub fn load_dotenv() {
    if let Ok(path) = dotenv::dotenv() {
        tracing::debug!(path = %path.display(), "Loaded .env file");
    }
}

/// Get service port from environment variables with proper fallback
///
/// # Arguments
/// * `service_name` - The name of the service (e.g., "EVOLUTION_API")
/// * `default_port` - The default port to use if not specified in environment
pub fn get_service_port(service_name: &str, default_port: u16) -> u16 {
    let var_name = format!("{}_SERVICE_PORT", service_name.to_uppercase());
    match env::var(&var_name) {
        Ok(raw) => raw.trim().parse::<u16>().unwrap_or_else(|_| {
            tracing::warn!("Invalid port in {}, using default {}", var_name, default_port);
            default_port
        }),
        Err(_) => default_port,
    }
}

/// Create a SocketAddr for binding a service
///
/// `{SERVICE}_SERVICE_ADDR` takes precedence (either `host:port` or
/// `http://host:port`); otherwise the service binds `0.0.0.0` on the port
/// resolved by [`get_service_port`].
pub fn get_bind_address(service_name: &str, default_port: u16) -> SocketAddr {
    let var_name = format!("{}_SERVICE_ADDR", service_name.to_uppercase());

    if let Ok(addr_str) = env::var(&var_name) {
        let trimmed = addr_str
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        match trimmed.parse::<SocketAddr>() {
            Ok(addr) => return addr,
            Err(_) => tracing::warn!("Invalid address format in {}, using default", var_name),
        }
    }

    let port = get_service_port(service_name, default_port);
    SocketAddr::from(([0, 0, 0, 0], port))
}

/// Read an environment variable and parse it, falling back to `default`
/// when it is unset or unparsable.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Read an optional, non-empty environment variable.
pub fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Truthy values: "1", "true", "yes", "on" (case-insensitive).
pub fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(val) => {
            let v = val.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        }
        Err(_) => default,
    }
}
