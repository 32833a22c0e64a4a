//! Flash target addressing

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// Upper bound on the number of addresses a single range may expand to
pub const MAX_RANGE_TARGETS: usize = 4096;

/// Address of a device to deliver an image to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FlashTarget {
    /// Local serial endpoint (device path or bridge address)
    Serial { port: String },
    /// Network endpoint reachable over IP
    Network { address: IpAddr },
}

impl FlashTarget {
    pub fn serial(port: impl Into<String>) -> Self {
        Self::Serial { port: port.into() }
    }

    pub fn network(address: IpAddr) -> Self {
        Self::Network { address }
    }

    pub fn is_serial(&self) -> bool {
        matches!(self, Self::Serial { .. })
    }
}

impl fmt::Display for FlashTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashTarget::Serial { port } => write!(f, "serial:{}", port),
            FlashTarget::Network { address } => write!(f, "ip:{}", address),
        }
    }
}

/// A set of network targets written by an operator
///
/// Accepted forms, comma separated and freely mixed:
/// - single address `192.168.4.10`
/// - last-octet range `192.168.4.1-254`
/// - CIDR block `192.168.4.0/24` (network and broadcast addresses skipped)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSet(Vec<IpAddr>);

impl TargetSet {
    pub fn new(addresses: Vec<IpAddr>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let unique = addresses.into_iter().filter(|a| seen.insert(*a)).collect();
        Self(unique)
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_targets(self) -> Vec<FlashTarget> {
        self.0.into_iter().map(FlashTarget::network).collect()
    }
}

impl FromStr for TargetSet {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addresses = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            addresses.extend(expand_part(part)?);
            if addresses.len() > MAX_RANGE_TARGETS {
                return Err(ProvisionError::validation(format!(
                    "target set expands to more than {} addresses",
                    MAX_RANGE_TARGETS
                )));
            }
        }
        if addresses.is_empty() {
            return Err(ProvisionError::validation("no network targets given"));
        }
        Ok(Self::new(addresses))
    }
}

fn expand_part(part: &str) -> Result<Vec<IpAddr>, ProvisionError> {
    if let Some((base, prefix)) = part.split_once('/') {
        return expand_cidr(base, prefix);
    }
    if let Some((start, end)) = part.split_once('-') {
        return expand_octet_range(start, end);
    }
    let address: IpAddr = part
        .parse()
        .map_err(|_| ProvisionError::validation(format!("invalid IP address '{}'", part)))?;
    Ok(vec![address])
}

fn parse_v4(s: &str) -> Result<Ipv4Addr, ProvisionError> {
    s.trim()
        .parse()
        .map_err(|_| ProvisionError::validation(format!("invalid IPv4 address '{}'", s)))
}

fn expand_octet_range(start: &str, end: &str) -> Result<Vec<IpAddr>, ProvisionError> {
    let first = parse_v4(start)?;
    let last: u8 = end
        .trim()
        .parse()
        .map_err(|_| ProvisionError::validation(format!("invalid range end '{}'", end)))?;
    let [a, b, c, d] = first.octets();
    if last < d {
        return Err(ProvisionError::validation(format!(
            "range end {} is below range start {}",
            last, d
        )));
    }
    Ok((d..=last)
        .map(|octet| IpAddr::V4(Ipv4Addr::new(a, b, c, octet)))
        .collect())
}

fn expand_cidr(base: &str, prefix: &str) -> Result<Vec<IpAddr>, ProvisionError> {
    let base = parse_v4(base)?;
    let prefix: u32 = prefix
        .trim()
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| ProvisionError::validation(format!("invalid CIDR prefix '{}'", prefix)))?;
    let host_bits = 32 - prefix;
    if host_bits > 12 {
        return Err(ProvisionError::validation(format!(
            "CIDR block /{} is too large",
            prefix
        )));
    }
    let mask = if prefix == 0 { 0 } else { u32::MAX << host_bits };
    let network = u32::from(base) & mask;
    let size = 1u32 << host_bits;
    let hosts: Vec<IpAddr> = if size <= 2 {
        (0..size).map(|i| IpAddr::V4(Ipv4Addr::from(network + i))).collect()
    } else {
        (1..size - 1)
            .map(|i| IpAddr::V4(Ipv4Addr::from(network + i)))
            .collect()
    };
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_octet_range() {
        let set: TargetSet = "192.168.4.1-4".parse().unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(set.addresses()[3], "192.168.4.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_cidr_skips_network_and_broadcast() {
        let set: TargetSet = "10.0.0.0/30".parse().unwrap();
        assert_eq!(
            set.addresses(),
            &["10.0.0.1".parse::<IpAddr>().unwrap(), "10.0.0.2".parse().unwrap()]
        );
    }

    #[test]
    fn test_mixed_list_dedups() {
        let set: TargetSet = "10.0.0.5, 10.0.0.4-6".parse().unwrap();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_invalid_targets() {
        assert!("".parse::<TargetSet>().is_err());
        assert!("10.0.0.9-3".parse::<TargetSet>().is_err());
        assert!("10.0.0.0/8".parse::<TargetSet>().is_err());
        assert!("not-an-ip".parse::<TargetSet>().is_err());
    }

    #[test]
    fn test_target_serde_shape() {
        let target = FlashTarget::serial("tcp:bench:4001");
        let json = serde_json::to_value(&target).unwrap();
        pretty_assertions::assert_eq!(
            json,
            serde_json::json!({"kind": "serial", "port": "tcp:bench:4001"})
        );
        let back: FlashTarget =
            serde_json::from_str(r#"{"kind":"network","address":"10.0.0.7"}"#).unwrap();
        assert!(!back.is_serial());
    }

    #[test]
    fn test_display() {
        assert_eq!(FlashTarget::serial("/dev/ttyUSB0").to_string(), "serial:/dev/ttyUSB0");
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(FlashTarget::network(ip).to_string(), "ip:10.0.0.1");
    }
}
