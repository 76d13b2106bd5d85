//! Configuration types.
//!
//! Every section mirrors the recognized option surface: optional fields with
//! serde defaults plus accessor methods that substitute the documented
//! default when a field is absent. Unknown keys are rejected so typos fail
//! loudly at load time instead of silently running with defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Default max payload per radio fragment.
const DEFAULT_FRAGMENT_SIZE: usize = 469;

/// Default initial flood TTL.
const DEFAULT_TTL: u8 = 7;

/// Default cap on concurrent fragment reassemblies (driver-enforced).
const DEFAULT_MAX_IN_FLIGHT_ASSEMBLIES: usize = 128;

/// Default per-peer outbox cap (implicit via the timeline cap).
const DEFAULT_OUTBOX_CAP_PER_PEER: usize = 1337;

/// Default rotating Bloom filter size in bytes.
const DEFAULT_BLOOM_MAX_BYTES: usize = 256;

/// Default Bloom target false-positive rate.
const DEFAULT_BLOOM_TARGET_FPR: f64 = 0.01;

/// Default request-sync cadence in seconds.
const DEFAULT_GOSSIP_PERIOD_SECS: u64 = 30;

/// Default embedded proxy SOCKS endpoint.
const DEFAULT_SOCKS_HOST: &str = "127.0.0.1";
const DEFAULT_SOCKS_PORT: u16 = 39050;

/// Default proxy control-channel port.
const DEFAULT_CONTROL_PORT: u16 = 39051;

/// Default nearest-relay fan-out per geohash.
const DEFAULT_RELAY_COUNT: usize = 5;

/// Configuration load/validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Mesh radio parameters (`mesh`).
    #[serde(default)]
    pub mesh: MeshConfig,

    /// Outbox parameters (`outbox`).
    #[serde(default)]
    pub outbox: OutboxConfig,

    /// Seen-set Bloom filter parameters (`bloom`).
    #[serde(default)]
    pub bloom: BloomConfig,

    /// Gossip sync parameters (`gossip`).
    #[serde(default)]
    pub gossip: GossipConfig,

    /// Overlay transport and embedded proxy parameters (`overlay`).
    #[serde(default)]
    pub overlay: OverlayConfig,

    /// Proof-of-work difficulty schedule (`pow`).
    #[serde(default)]
    pub pow: PowConfig,

    /// Network policy (`policy`).
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Ingress rate limiting (`ingress`).
    #[serde(default)]
    pub ingress: IngressConfig,
}

impl Config {
    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fpr = self.bloom.target_fpr();
        if !(fpr > 0.0 && fpr < 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "bloom.target_fpr",
                reason: format!("must be in (0, 1), got {}", fpr),
            });
        }
        if self.bloom.max_bytes() == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bloom.max_bytes",
                reason: "must be positive".into(),
            });
        }
        if self.mesh.fragment_size() == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mesh.fragment_size",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Mesh radio configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    /// Max payload per radio fragment (`fragment_size`). Defaults to 469.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_size: Option<usize>,

    /// Initial flood TTL (`ttl_default`). Defaults to 7.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_default: Option<u8>,

    /// Cap on concurrent fragment reassemblies (`max_in_flight_assemblies`).
    /// Defaults to 128. Enforced by the radio driver; carried here so one
    /// config document configures both layers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight_assemblies: Option<usize>,
}

impl MeshConfig {
    pub fn fragment_size(&self) -> usize {
        self.fragment_size.unwrap_or(DEFAULT_FRAGMENT_SIZE)
    }

    pub fn ttl_default(&self) -> u8 {
        self.ttl_default.unwrap_or(DEFAULT_TTL)
    }

    pub fn max_in_flight_assemblies(&self) -> usize {
        self.max_in_flight_assemblies
            .unwrap_or(DEFAULT_MAX_IN_FLIGHT_ASSEMBLIES)
    }
}

/// Outbox configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutboxConfig {
    /// Per-peer queued-send cap (`cap_per_peer`). Defaults to 1337.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_per_peer: Option<usize>,
}

impl OutboxConfig {
    pub fn cap_per_peer(&self) -> usize {
        self.cap_per_peer.unwrap_or(DEFAULT_OUTBOX_CAP_PER_PEER)
    }
}

/// Seen-set Bloom filter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BloomConfig {
    /// Rotating filter size in bytes (`max_bytes`). Defaults to 256.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<usize>,

    /// Target false-positive rate (`target_fpr`). Defaults to 0.01.
    /// Informs the derived capacity and hash count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_fpr: Option<f64>,
}

impl BloomConfig {
    pub fn max_bytes(&self) -> usize {
        self.max_bytes.unwrap_or(DEFAULT_BLOOM_MAX_BYTES)
    }

    pub fn target_fpr(&self) -> f64 {
        self.target_fpr.unwrap_or(DEFAULT_BLOOM_TARGET_FPR)
    }
}

/// Gossip sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GossipConfig {
    /// Request-sync cadence in seconds (`period_seconds`). Defaults to 30.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<u64>,
}

impl GossipConfig {
    pub fn period_seconds(&self) -> u64 {
        self.period_seconds.unwrap_or(DEFAULT_GOSSIP_PERIOD_SECS)
    }
}

/// Overlay transport and embedded proxy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverlayConfig {
    /// SOCKS host of the embedded proxy (`socks_host`). Defaults to 127.0.0.1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_host: Option<String>,

    /// SOCKS port of the embedded proxy (`socks_port`). Defaults to 39050.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_port: Option<u16>,

    /// Control-channel port (`control_port`). Defaults to 39051.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,

    /// Nearest-relay fan-out per geohash (`relay_count_per_geohash`).
    /// Defaults to 5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_count_per_geohash: Option<usize>,

    /// Proxy data directory (`data_dir`), holding the control cookie file.
    /// No default; the embedder must supply it before proxy startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl OverlayConfig {
    pub fn socks_host(&self) -> &str {
        self.socks_host.as_deref().unwrap_or(DEFAULT_SOCKS_HOST)
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port.unwrap_or(DEFAULT_SOCKS_PORT)
    }

    pub fn control_port(&self) -> u16 {
        self.control_port.unwrap_or(DEFAULT_CONTROL_PORT)
    }

    pub fn relay_count_per_geohash(&self) -> usize {
        self.relay_count_per_geohash.unwrap_or(DEFAULT_RELAY_COUNT)
    }

    pub fn data_dir(&self) -> Option<&PathBuf> {
        self.data_dir.as_ref()
    }
}

/// Proof-of-work difficulty schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowConfig {
    /// Required leading-zero bits for geohash precision <= 5. Defaults to 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits_coarse: Option<u32>,

    /// Required leading-zero bits for geohash precision 6. Defaults to 9.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits_medium: Option<u32>,

    /// Required leading-zero bits for geohash precision >= 7. Defaults to 8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits_fine: Option<u32>,
}

impl PowConfig {
    pub fn bits_coarse(&self) -> u32 {
        self.bits_coarse.unwrap_or(10)
    }

    pub fn bits_medium(&self) -> u32 {
        self.bits_medium.unwrap_or(9)
    }

    pub fn bits_fine(&self) -> u32 {
        self.bits_fine.unwrap_or(8)
    }

    /// Required leading-zero bits for a geohash of the given precision.
    pub fn required_bits(&self, precision: usize) -> u32 {
        match precision {
            0..=5 => self.bits_coarse(),
            6 => self.bits_medium(),
            _ => self.bits_fine(),
        }
    }
}

/// Network policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Enforce proxy readiness before any overlay egress (`fail_closed`).
    /// Defaults to true. Disabling this is a development-only override.
    #[serde(default = "default_fail_closed")]
    pub fail_closed: bool,
}

fn default_fail_closed() -> bool {
    true
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { fail_closed: true }
    }
}

/// Ingress rate-limit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngressConfig {
    /// Per-sender token bucket burst. Defaults to 30.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_burst: Option<u32>,

    /// Per-sender refill rate in tokens/second. Defaults to 1.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_refill_rate: Option<f64>,

    /// Identical-content token bucket burst. Defaults to 10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_burst: Option<u32>,

    /// Identical-content refill rate in tokens/second. Defaults to 0.5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_refill_rate: Option<f64>,
}

impl IngressConfig {
    pub fn sender_burst(&self) -> u32 {
        self.sender_burst.unwrap_or(30)
    }

    pub fn sender_refill_rate(&self) -> f64 {
        self.sender_refill_rate.unwrap_or(1.0)
    }

    pub fn content_burst(&self) -> u32 {
        self.content_burst.unwrap_or(10)
    }

    pub fn content_refill_rate(&self) -> f64 {
        self.content_refill_rate.unwrap_or(0.5)
    }
}
