//! ARP subsystem parameters.
//!
//! `ArpConfig` can be flattened into a daemon's clap arguments or read from
//! the JSON agent configuration; both paths share the same defaults.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Name of the underlay VRF.
pub const DEFAULT_FABRIC_VRF: &str = "default-domain:default-project:ip-fabric:__default__";

pub const DEFAULT_MAX_RETRIES: u32 = 8;
pub const DEFAULT_RETRY_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_AGING_TIMEOUT_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_GRAT_RETRIES: u32 = 2;
pub const DEFAULT_GRAT_RETRY_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_MIN_AAP_PREFIX_LEN: u8 = 24;

/// Prefix length of a single IPv4 host.
pub const MAX_V4_PREFIX_LEN: u8 = 32;

/// Shortest accepted `min_aap_prefix_len`; bounds one block to 2^16 probes.
pub const MIN_AAP_PREFIX_LEN_FLOOR: u8 = 16;

#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArpConfig {
    /// Router (vhost) address of this agent; 0.0.0.0 when not yet configured
    #[arg(long = "arp-router-id", default_value_t = Ipv4Addr::UNSPECIFIED)]
    pub router_id: Ipv4Addr,

    /// Name of the fabric (underlay) VRF
    #[arg(long = "arp-fabric-vrf", default_value_t = DEFAULT_FABRIC_VRF.to_string())]
    pub fabric_vrf_name: String,

    /// Request probes sent before a resolution is abandoned
    #[arg(long = "arp-max-retries", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Interval between request probes in milliseconds
    #[arg(long = "arp-retry-timeout-ms", default_value_t = DEFAULT_RETRY_TIMEOUT_MS)]
    pub retry_timeout_ms: u64,

    /// Lifetime of a resolved binding without refresh in milliseconds
    #[arg(long = "arp-aging-timeout-ms", default_value_t = DEFAULT_AGING_TIMEOUT_MS)]
    pub aging_timeout_ms: u64,

    /// Gratuitous announcements repeated after the first one
    #[arg(long = "arp-grat-retries", default_value_t = DEFAULT_GRAT_RETRIES)]
    pub grat_retries: u32,

    /// Interval between gratuitous announcements in milliseconds
    #[arg(long = "arp-grat-retry-timeout-ms", default_value_t = DEFAULT_GRAT_RETRY_TIMEOUT_MS)]
    pub grat_retry_timeout_ms: u64,

    /// Shortest allowed-address-pair prefix probed address by address
    #[arg(long = "arp-min-aap-prefix-len", default_value_t = DEFAULT_MIN_AAP_PREFIX_LEN)]
    pub min_aap_prefix_len: u8,

    /// Lock shards of the entry registry (rounded up to a power of two)
    #[arg(long = "arp-registry-shards", default_value_t = 16)]
    pub registry_shards: usize,

    /// Worker partitions of the event service
    #[arg(long = "arp-partitions", default_value_t = 4)]
    pub partitions: usize,
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            router_id: Ipv4Addr::UNSPECIFIED,
            fabric_vrf_name: DEFAULT_FABRIC_VRF.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_timeout_ms: DEFAULT_RETRY_TIMEOUT_MS,
            aging_timeout_ms: DEFAULT_AGING_TIMEOUT_MS,
            grat_retries: DEFAULT_GRAT_RETRIES,
            grat_retry_timeout_ms: DEFAULT_GRAT_RETRY_TIMEOUT_MS,
            min_aap_prefix_len: DEFAULT_MIN_AAP_PREFIX_LEN,
            registry_shards: 16,
            partitions: 4,
        }
    }
}

impl ArpConfig {
    /// Read a JSON configuration file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: ArpConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_aap_prefix_len > MAX_V4_PREFIX_LEN {
            return Err(ConfigError::Invalid(format!(
                "min_aap_prefix_len {} exceeds {}",
                self.min_aap_prefix_len, MAX_V4_PREFIX_LEN
            )));
        }
        if self.min_aap_prefix_len < MIN_AAP_PREFIX_LEN_FLOOR {
            return Err(ConfigError::Invalid(format!(
                "min_aap_prefix_len {} is below {}",
                self.min_aap_prefix_len, MIN_AAP_PREFIX_LEN_FLOOR
            )));
        }
        if self.registry_shards == 0 {
            return Err(ConfigError::Invalid(
                "registry_shards must be at least 1".to_string(),
            ));
        }
        if self.partitions == 0 {
            return Err(ConfigError::Invalid(
                "partitions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn aging_timeout(&self) -> Duration {
        Duration::from_millis(self.aging_timeout_ms)
    }

    pub fn grat_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.grat_retry_timeout_ms)
    }

    /// Router id has been provisioned.
    pub fn router_id_configured(&self) -> bool {
        !self.router_id.is_unspecified()
    }

    /// Upper bound on addresses probed for one allowed-address-pair block.
    pub fn max_arp_probe_addresses(&self) -> u64 {
        let diff = MAX_V4_PREFIX_LEN.saturating_sub(self.min_aap_prefix_len);
        1u64 << diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        arp: ArpConfig,
    }

    #[test]
    fn test_defaults() {
        let config = ArpConfig::default();
        assert_eq!(config.max_retries, 8);
        assert_eq!(config.retry_timeout(), Duration::from_secs(2));
        assert_eq!(config.aging_timeout(), Duration::from_secs(300));
        assert_eq!(config.grat_retries, 2);
        assert!(!config.router_id_configured());
        assert_eq!(config.max_arp_probe_addresses(), 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_defaults_match() {
        let cli = TestCli::parse_from(["test"]);
        assert_eq!(cli.arp, ArpConfig::default());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = TestCli::parse_from([
            "test",
            "--arp-router-id",
            "192.168.1.1",
            "--arp-max-retries",
            "3",
            "--arp-min-aap-prefix-len",
            "28",
        ]);
        assert_eq!(cli.arp.router_id, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(cli.arp.max_retries, 3);
        assert_eq!(cli.arp.max_arp_probe_addresses(), 16);
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "router_id": "10.1.1.1", "aging_timeout_ms": 1000 }}"#
        )
        .unwrap();

        let config = ArpConfig::load(file.path()).unwrap();
        assert_eq!(config.router_id, Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(config.aging_timeout(), Duration::from_secs(1));
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.fabric_vrf_name, DEFAULT_FABRIC_VRF);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "min_aap_prefix_len": 40 }}"#).unwrap();
        assert!(matches!(
            ArpConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut wide = tempfile::NamedTempFile::new().unwrap();
        write!(wide, r#"{{ "min_aap_prefix_len": 8 }}"#).unwrap();
        assert!(matches!(
            ArpConfig::load(wide.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        write!(garbage, "not json").unwrap();
        assert!(matches!(
            ArpConfig::load(garbage.path()),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_min_aap_prefix_len_bounds() {
        let mut config = ArpConfig {
            min_aap_prefix_len: MIN_AAP_PREFIX_LEN_FLOOR,
            ..ArpConfig::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.max_arp_probe_addresses(), 1 << 16);

        config.min_aap_prefix_len = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
