//! Runtime toggles consumed by the core.
//!
//! Values only; flag parsing belongs to whatever supervises the process.
//! `from_env()` mirrors the environment switches the bridge roles pass to
//! their child processes.

/// Environment variable: log every packet sent and dispatched.
pub const ENV_DEBUG: &str = "SESSIONWIRE_DEBUG";
/// Environment variable: hex-dump outbound packet values in logs.
pub const ENV_HEXDUMP: &str = "SESSIONWIRE_HEXDUMP";
/// Environment variable: corrupt every Nth send (0 disables).
pub const ENV_FAULT_RATE: &str = "SESSIONWIRE_FAULT_INJECTION_RATE";
/// Environment variable: flush the transport after every send.
pub const ENV_FLUSH: &str = "SESSIONWIRE_FLUSH";

/// Diagnostic and test toggles.
#[derive(Debug, Clone, Default)]
pub struct WireConfig {
    /// Verbose per-packet logging.
    pub debug: bool,
    /// Hex-dump outbound packet values (truncated) for inspection.
    pub hexdump: bool,
    /// Corrupt every Nth outbound send; 0 disables fault injection.
    pub fault_rate: u32,
    /// Flush the transport after every send (low-latency transports).
    pub flush_after_send: bool,
}

impl WireConfig {
    /// Read the toggles from the process environment.
    pub fn from_env() -> Self {
        Self {
            debug: env_bool(ENV_DEBUG),
            hexdump: env_bool(ENV_HEXDUMP),
            fault_rate: env_u32(ENV_FAULT_RATE),
            flush_after_send: env_bool(ENV_FLUSH),
        }
    }
}

fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_u32(name: &str) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Hex-dump helper for the hexdump toggle, truncated to 32 bytes.
pub fn hexstr(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().min(32) * 2 + 2);
    for &b in data.iter().take(32) {
        out.push_str(&format!("{b:02x}"));
    }
    if data.len() > 32 {
        out.push_str("..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_all_off() {
        let config = WireConfig::default();
        assert!(!config.debug);
        assert!(!config.hexdump);
        assert_eq!(config.fault_rate, 0);
        assert!(!config.flush_after_send);
    }

    #[test]
    fn test_hexstr_truncates() {
        assert_eq!(hexstr(&[0x00, 0xff, 0x10]), "00ff10");
        let long = vec![0xabu8; 40];
        let dumped = hexstr(&long);
        assert!(dumped.ends_with(".."));
        assert_eq!(dumped.len(), 66);
    }
}
