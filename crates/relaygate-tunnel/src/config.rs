//! Gateway tunnel configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Default value functions for serde
// =============================================================================

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

const fn default_port_range() -> (u16, u16) {
    (8000, 8100)
}

const fn default_socket_read_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_provider_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_max_chunk_size() -> usize {
    1024
}

const fn default_max_requests_per_socket() -> u32 {
    50
}

const fn default_sweep_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_consumer_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_provider_idle_timeout() -> Duration {
    Duration::from_secs(80)
}

// =============================================================================
// Gateway Configuration
// =============================================================================

/// Configuration shared by the consumer and provider sides of a gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// IP address consumer-side listeners bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Ports reserved for consumer-side listeners (inclusive)
    #[serde(default = "default_port_range")]
    pub port_range: (u16, u16),

    /// Bound on every blocking socket operation (accept, handshake, read, write)
    #[serde(default = "default_socket_read_timeout", with = "humantime_serde")]
    pub socket_read_timeout: Duration,

    /// Bound on establishing the outbound provider connection
    #[serde(
        default = "default_provider_connect_timeout",
        with = "humantime_serde"
    )]
    pub provider_connect_timeout: Duration,

    /// Maximum bytes read from a socket and carried by one relay message
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    /// Counted requests a provider-side socket serves before it is rotated
    #[serde(default = "default_max_requests_per_socket")]
    pub max_requests_per_socket: u32,

    /// Period of the idle connection sweeper
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Idle time after which a consumer-side worker is interrupted
    #[serde(default = "default_consumer_idle_timeout", with = "humantime_serde")]
    pub consumer_idle_timeout: Duration,

    /// Idle time after which a provider-side handler is closed
    #[serde(default = "default_provider_idle_timeout", with = "humantime_serde")]
    pub provider_idle_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port_range: default_port_range(),
            socket_read_timeout: default_socket_read_timeout(),
            provider_connect_timeout: default_provider_connect_timeout(),
            max_chunk_size: default_max_chunk_size(),
            max_requests_per_socket: default_max_requests_per_socket(),
            sweep_interval: default_sweep_interval(),
            consumer_idle_timeout: default_consumer_idle_timeout(),
            provider_idle_timeout: default_provider_idle_timeout(),
        }
    }
}

impl GatewayConfig {
    /// Create a new config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports in the configured range, in ascending order
    pub fn ports(&self) -> impl Iterator<Item = u16> {
        let (start, end) = self.port_range;
        start..=end
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error string if:
    /// - `bind_address` is not an IP address
    /// - `port_range` start > end or start < 1024
    /// - any timeout, the chunk size or the request limit is zero
    /// - `provider_idle_timeout` < `consumer_idle_timeout` + `sweep_interval`
    pub fn validate(&self) -> Result<(), String> {
        if self.bind_address.parse::<std::net::IpAddr>().is_err() {
            return Err(format!(
                "bind_address ({}) must be an IP address",
                self.bind_address
            ));
        }

        let (start, end) = self.port_range;
        if start > end {
            return Err(format!("port_range start ({start}) must be <= end ({end})"));
        }

        if start < 1024 {
            return Err(format!(
                "port_range start ({start}) should be >= 1024 (privileged ports)"
            ));
        }

        for (name, value) in [
            ("socket_read_timeout", self.socket_read_timeout),
            ("provider_connect_timeout", self.provider_connect_timeout),
            ("sweep_interval", self.sweep_interval),
            ("consumer_idle_timeout", self.consumer_idle_timeout),
            ("provider_idle_timeout", self.provider_idle_timeout),
        ] {
            if value.is_zero() {
                return Err(format!("{name} must be > 0"));
            }
        }

        if self.max_chunk_size == 0 {
            return Err("max_chunk_size must be > 0".to_string());
        }

        if self.max_requests_per_socket == 0 {
            return Err("max_requests_per_socket must be > 0".to_string());
        }

        // Provider side outlives an idle consumer side by at least one sweep
        if self.provider_idle_timeout < self.consumer_idle_timeout + self.sweep_interval {
            return Err(format!(
                "provider_idle_timeout ({:?}) must be >= consumer_idle_timeout ({:?}) + sweep_interval ({:?})",
                self.provider_idle_timeout, self.consumer_idle_timeout, self.sweep_interval
            ));
        }

        Ok(())
    }
}

// =============================================================================
// humantime_serde module for Duration serialization
// =============================================================================

mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        };
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_number(num_str: &str) -> Result<u64, String> {
        num_str
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration number: {num_str}"))
    }

    fn scaled(num_str: &str, unit_secs: u64) -> Result<Duration, String> {
        parse_number(num_str)?
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("invalid duration number: {num_str}"))
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(num_str) = s.strip_suffix("ms") {
            return Ok(Duration::from_millis(parse_number(num_str)?));
        }

        if let Some(num_str) = s.strip_suffix('s') {
            return Ok(Duration::from_secs(parse_number(num_str)?));
        }

        if let Some(num_str) = s.strip_suffix('m') {
            return scaled(num_str, 60);
        }

        if let Some(num_str) = s.strip_suffix('h') {
            return scaled(num_str, 3600);
        }

        Err(format!("invalid duration format: {s}"))
    }
}
