//! Protocol configuration.
//!
//! All tunables have defaults and every field may be omitted from a TOML
//! file:
//!
//! ```toml
//! [keystore]
//! rotation_threshold = 1000
//!
//! [pulse]
//! interval_ms = 100
//! loss_threshold = 3
//!
//! [flow]
//! initial_window = 10.0
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Key store configuration
    pub keystore: KeyStoreConfig,
    /// Pulse/gap tracker configuration
    pub pulse: PulseConfig,
    /// Flow controller configuration
    pub flow: FlowConfig,
    /// Datagram layer configuration
    pub datagram: DatagramConfig,
}

/// Key store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeyStoreConfig {
    /// Punctured (or sent) sequences after which a session should be rotated
    pub rotation_threshold: usize,
    /// Number of retired master-secret fingerprints remembered to refuse reuse
    pub retired_fingerprints: usize,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            rotation_threshold: 1000,
            retired_fingerprints: 1024,
        }
    }
}

/// Pulse/gap tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PulseConfig {
    /// Keep-alive interval in milliseconds
    pub interval_ms: u64,
    /// Missed intervals before a peer is considered unhealthy
    pub loss_threshold: u32,
    /// Upper bound on outstanding gaps per peer (oldest evicted first)
    pub max_tracked_gaps: usize,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            loss_threshold: 3,
            max_tracked_gaps: 4096,
        }
    }
}

impl PulseConfig {
    /// Keep-alive interval
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Silence after which a peer is unhealthy
    #[must_use]
    pub fn liveness_timeout(&self) -> Duration {
        self.interval() * self.loss_threshold
    }
}

/// Flow controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlowConfig {
    /// Initial congestion window (packets)
    pub initial_window: f64,
    /// Lower window bound (packets)
    pub min_window: f64,
    /// Upper window bound (packets)
    pub max_window: f64,
    /// RTT assumed before the first sample, in milliseconds
    pub default_rtt_ms: u64,
    /// Maximum datagram size used for throughput estimates
    pub max_packet_size: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            initial_window: 10.0,
            min_window: 2.0,
            max_window: 1024.0,
            default_rtt_ms: 100,
            max_packet_size: 1200,
        }
    }
}

impl FlowConfig {
    /// Default RTT
    #[must_use]
    pub fn default_rtt(&self) -> Duration {
        Duration::from_millis(self.default_rtt_ms)
    }
}

/// Datagram layer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatagramConfig {
    /// Sent packets retained per peer for retransmission
    pub max_pending_packets: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            max_pending_packets: 1024,
        }
    }
}

impl ProtocolConfig {
    /// Parse from TOML text and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on parse or validation failure.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] on failure.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keystore.rotation_threshold == 0 {
            return Err(ConfigError::Invalid(
                "keystore.rotation_threshold must be positive".into(),
            ));
        }

        if self.pulse.interval_ms == 0 {
            return Err(ConfigError::Invalid("pulse.interval_ms must be positive".into()));
        }
        if self.pulse.loss_threshold == 0 {
            return Err(ConfigError::Invalid(
                "pulse.loss_threshold must be positive".into(),
            ));
        }

        let flow = &self.flow;
        if !(flow.min_window >= 1.0 && flow.min_window <= flow.max_window) {
            return Err(ConfigError::Invalid(
                "flow.min_window must be in [1, max_window]".into(),
            ));
        }
        if !(flow.initial_window >= flow.min_window && flow.initial_window <= flow.max_window) {
            return Err(ConfigError::Invalid(
                "flow.initial_window must lie within [min_window, max_window]".into(),
            ));
        }
        if flow.default_rtt_ms == 0 {
            return Err(ConfigError::Invalid("flow.default_rtt_ms must be positive".into()));
        }
        if flow.max_packet_size < crate::HEADER_SIZE || flow.max_packet_size > 65_535 {
            return Err(ConfigError::Invalid(format!(
                "flow.max_packet_size must be in [{}, 65535]",
                crate::HEADER_SIZE
            )));
        }

        Ok(())
    }
}
