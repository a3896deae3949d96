use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use crate::error::Error;

/// A `[lo, hi]` packet-size bucket with its sampling probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeBucket {
    pub lo: usize,
    pub hi: usize,
    pub probability: f64,
}

impl SizeBucket {
    pub fn midpoint(&self) -> usize {
        (self.lo + self.hi) / 2
    }
}

/// A MAC prefix such as `aa:aa:aa:aa:aa:a0/44`: the top `prefix_len` bits
/// are fixed, the remaining bits are the generator's address space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacRange {
    pub base: u64, // lower 48 bits
    pub prefix_len: u8,
}

impl MacRange {
    pub fn free_bits(&self) -> u8 {
        48 - self.prefix_len
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ipv4Range {
    pub base: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ipv4Range {
    pub fn free_bits(&self) -> u8 {
        32 - self.prefix_len
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ipv6Range {
    pub base: Ipv6Addr,
    pub prefix_len: u8,
}

impl Ipv6Range {
    pub fn free_bits(&self) -> u8 {
        128 - self.prefix_len
    }
}

/// Protocol layers that may be enabled for generated flows.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolOption {
    Vlan,
    Mpls,
    Dns,
    Http,
    Tls,
}

/// Validated run configuration. Read-only for the run's duration.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub mtu: usize,
    pub sampling: f64,
    pub loops: u64,
    pub speed_multiplier: f64,
    pub mbps: Option<f64>,
    pub pps: Option<f64>,
    pub mbps_required: Option<f64>,
    pub mbps_accuracy: f64,
    pub speed_max: f64,
    pub mac_range: MacRange,
    pub ipv4_range: Ipv4Range,
    pub ipv6_range: Ipv6Range,
    pub protocols: Vec<ProtocolOption>,
    /// Flow-termination heuristics of the profile's source collector,
    /// informational only.
    pub active_timeout: u64,
    pub inactive_timeout: u64,
    pub size_buckets: Vec<SizeBucket>,
    pub vlan_id: u16,
    pub mpls_label: u32,
}

impl GeneratorConfig {
    pub fn protocol_enabled(&self, p: ProtocolOption) -> bool {
        self.protocols.contains(&p)
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        import_config("").expect("empty configuration must be valid")
    }
}

/// On-disk shape of the configuration file. All keys are optional;
/// validation happens when converting to [`GeneratorConfig`].
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    mtu: Option<usize>,
    sampling: Option<f64>,
    loops: Option<u64>,
    speed_multiplier: Option<f64>,
    mbps: Option<f64>,
    pps: Option<f64>,
    mbps_required: Option<f64>,
    mbps_accuracy: Option<f64>,
    speed_max: Option<f64>,
    mac_range: Option<String>,
    ipv4_range: Option<String>,
    ipv6_range: Option<String>,
    protocols: Option<Vec<ProtocolOption>>,
    active_timeout: Option<u64>,
    inactive_timeout: Option<u64>,
    packet_size_probabilities: Option<BTreeMap<String, f64>>,
    vlan_id: Option<u16>,
    mpls_label: Option<u32>,
}

pub fn import_config_file(path: &Path) -> Result<GeneratorConfig, Error> {
    let content = std::fs::read_to_string(path)?;
    import_config(&content)
}

/// Parses and validates a TOML run configuration.
pub fn import_config(config: &str) -> Result<GeneratorConfig, Error> {
    let raw: RawConfig =
        toml::from_str(config).map_err(|e| Error::format(format!("configuration: {e}")))?;

    let mtu = raw.mtu.unwrap_or(1500);
    if !(576..=65535).contains(&mtu) {
        return Err(Error::range(format!("mtu {mtu} outside [576, 65535]")));
    }
    let sampling = raw.sampling.unwrap_or(1.0);
    if !(sampling > 0.0 && sampling <= 1.0) {
        return Err(Error::range(format!("sampling {sampling} outside (0, 1]")));
    }
    let loops = raw.loops.unwrap_or(1);
    if loops == 0 {
        return Err(Error::range("loops must be at least 1".to_string()));
    }
    let speed_multiplier = raw.speed_multiplier.unwrap_or(1.0);
    if speed_multiplier <= 0.0 {
        return Err(Error::range(format!(
            "speed_multiplier {speed_multiplier} must be positive"
        )));
    }
    let mbps_accuracy = raw.mbps_accuracy.unwrap_or(0.05);
    if !(0.0..1.0).contains(&mbps_accuracy) {
        return Err(Error::range(format!(
            "mbps_accuracy {mbps_accuracy} outside [0, 1)"
        )));
    }
    let speed_max = raw.speed_max.unwrap_or(f64::MAX);
    if speed_max < 1.0 {
        return Err(Error::range(format!("speed_max {speed_max} below 1.0")));
    }

    let mac_range = parse_mac_range(raw.mac_range.as_deref().unwrap_or("02:00:00:00:00:00/24"))?;
    let ipv4_range = parse_ipv4_range(raw.ipv4_range.as_deref().unwrap_or("10.0.0.0/8"))?;
    let ipv6_range = parse_ipv6_range(raw.ipv6_range.as_deref().unwrap_or("fd00::/64"))?;

    let size_buckets = match raw.packet_size_probabilities {
        Some(table) => parse_size_buckets(&table, mtu)?,
        None => default_size_buckets(),
    };

    Ok(GeneratorConfig {
        mtu,
        sampling,
        loops,
        speed_multiplier,
        mbps: raw.mbps,
        pps: raw.pps,
        mbps_required: raw.mbps_required,
        mbps_accuracy,
        speed_max,
        mac_range,
        ipv4_range,
        ipv6_range,
        protocols: raw.protocols.unwrap_or_else(|| {
            vec![ProtocolOption::Dns, ProtocolOption::Http, ProtocolOption::Tls]
        }),
        active_timeout: raw.active_timeout.unwrap_or(300),
        inactive_timeout: raw.inactive_timeout.unwrap_or(30),
        size_buckets,
        vlan_id: raw.vlan_id.unwrap_or(100),
        mpls_label: raw.mpls_label.unwrap_or(16),
    })
}

fn parse_mac_range(s: &str) -> Result<MacRange, Error> {
    let (addr, len) = split_prefix(s)?;
    if len > 48 {
        return Err(Error::range(format!("MAC prefix length {len} exceeds 48")));
    }
    let mut base: u64 = 0;
    let bytes: Vec<&str> = addr.split(':').collect();
    if bytes.len() != 6 {
        return Err(Error::format(format!("invalid MAC address {addr}")));
    }
    for b in bytes {
        let v = u8::from_str_radix(b, 16)
            .map_err(|_| Error::format(format!("invalid MAC address {addr}")))?;
        base = (base << 8) | u64::from(v);
    }
    // ignore bits below the prefix
    let mask = if len == 0 { 0 } else { !0u64 << (48 - len) & 0xffff_ffff_ffff };
    Ok(MacRange {
        base: base & mask,
        prefix_len: len,
    })
}

fn parse_ipv4_range(s: &str) -> Result<Ipv4Range, Error> {
    let (addr, len) = split_prefix(s)?;
    if len > 32 {
        return Err(Error::range(format!("IPv4 prefix length {len} exceeds 32")));
    }
    let base: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::format(format!("invalid IPv4 address {addr}")))?;
    let mask = if len == 0 { 0 } else { !0u32 << (32 - len) };
    Ok(Ipv4Range {
        base: Ipv4Addr::from(u32::from(base) & mask),
        prefix_len: len,
    })
}

fn parse_ipv6_range(s: &str) -> Result<Ipv6Range, Error> {
    let (addr, len) = split_prefix(s)?;
    if len > 128 {
        return Err(Error::range(format!("IPv6 prefix length {len} exceeds 128")));
    }
    // one LFSR word covers the host part; longer host parts are not supported
    if len < 64 {
        return Err(Error::range(format!(
            "IPv6 prefix length {len} below 64: at most 64 host bits are supported"
        )));
    }
    let base: Ipv6Addr = addr
        .parse()
        .map_err(|_| Error::format(format!("invalid IPv6 address {addr}")))?;
    let mask = if len == 0 { 0 } else { !0u128 << (128 - len) };
    Ok(Ipv6Range {
        base: Ipv6Addr::from(u128::from(base) & mask),
        prefix_len: len,
    })
}

fn split_prefix(s: &str) -> Result<(&str, u8), Error> {
    let (addr, len) = s
        .split_once('/')
        .ok_or_else(|| Error::format(format!("missing prefix length in range {s}")))?;
    let len: u8 = len
        .parse()
        .map_err(|_| Error::format(format!("invalid prefix length in range {s}")))?;
    Ok((addr, len))
}

/// Keys are `lo-hi` byte ranges; values must sum to 1 within rounding.
fn parse_size_buckets(
    table: &BTreeMap<String, f64>,
    mtu: usize,
) -> Result<Vec<SizeBucket>, Error> {
    let mut buckets = Vec::with_capacity(table.len());
    for (key, &probability) in table {
        let (lo, hi) = key
            .split_once('-')
            .ok_or_else(|| Error::format(format!("invalid size bucket key {key}")))?;
        let lo: usize = lo
            .trim()
            .parse()
            .map_err(|_| Error::format(format!("invalid size bucket key {key}")))?;
        let hi: usize = hi
            .trim()
            .parse()
            .map_err(|_| Error::format(format!("invalid size bucket key {key}")))?;
        if lo > hi {
            return Err(Error::range(format!("size bucket {key} has lo > hi")));
        }
        if hi > mtu + crate::layers::MAX_LINK_OVERHEAD {
            return Err(Error::range(format!(
                "size bucket {key} exceeds mtu {mtu} plus link overhead"
            )));
        }
        if !(0.0..=1.0).contains(&probability) {
            return Err(Error::range(format!(
                "size bucket {key} probability {probability} outside [0, 1]"
            )));
        }
        buckets.push(SizeBucket {
            lo,
            hi,
            probability,
        });
    }
    if buckets.is_empty() {
        return Err(Error::format("empty packet_size_probabilities".to_string()));
    }
    let total: f64 = buckets.iter().map(|b| b.probability).sum();
    if (total - 1.0).abs() > 1e-6 {
        return Err(Error::range(format!(
            "size bucket probabilities sum to {total}, expected 1"
        )));
    }
    buckets.sort_by_key(|b| b.lo);
    Ok(buckets)
}

/// Rough distribution of a mixed traffic capture, used when the
/// configuration does not provide one.
fn default_size_buckets() -> Vec<SizeBucket> {
    vec![
        SizeBucket {
            lo: 64,
            hi: 127,
            probability: 0.3,
        },
        SizeBucket {
            lo: 128,
            hi: 511,
            probability: 0.2,
        },
        SizeBucket {
            lo: 512,
            hi: 1023,
            probability: 0.15,
        },
        SizeBucket {
            lo: 1024,
            hi: 1518,
            probability: 0.35,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GeneratorConfig::default();
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.loops, 1);
        assert_eq!(config.mac_range.free_bits(), 24);
    }

    #[test]
    fn test_config() {
        let config = import_config(
            r#"
mtu = 1500
sampling = 0.5
loops = 5
mac_range = "aa:aa:aa:aa:aa:a0/44"
ipv4_range = "192.168.0.0/16"
ipv6_range = "fd12:3456::/64"
protocols = ["dns", "http"]

[packet_size_probabilities]
"64-128" = 0.6
"129-1500" = 0.4
"#,
        )
        .unwrap();
        assert_eq!(config.loops, 5);
        assert_eq!(config.mac_range.prefix_len, 44);
        assert_eq!(config.mac_range.free_bits(), 4);
        assert_eq!(config.ipv4_range.base, Ipv4Addr::new(192, 168, 0, 0));
        assert!(config.protocol_enabled(ProtocolOption::Dns));
        assert!(!config.protocol_enabled(ProtocolOption::Tls));
        assert_eq!(config.size_buckets.len(), 2);
        assert_eq!(config.size_buckets[0].lo, 64);
    }

    #[test]
    fn rejects_bad_sampling() {
        assert!(matches!(
            import_config("sampling = 0.0"),
            Err(Error::Range(_))
        ));
        assert!(matches!(
            import_config("sampling = 1.5"),
            Err(Error::Range(_))
        ));
    }

    #[test]
    fn rejects_wide_ipv6_prefix() {
        assert!(matches!(
            import_config(r#"ipv6_range = "fd00::/48""#),
            Err(Error::Range(_))
        ));
    }

    #[test]
    fn rejects_unbalanced_buckets() {
        let result = import_config(
            r#"
[packet_size_probabilities]
"64-128" = 0.6
"129-1500" = 0.1
"#,
        );
        assert!(matches!(result, Err(Error::Range(_))));
    }

    #[test]
    fn mac_base_is_masked_to_prefix() {
        let range = parse_mac_range("aa:aa:aa:aa:aa:af/44").unwrap();
        assert_eq!(range.base, 0xaaaa_aaaa_aaa0);
    }
}
