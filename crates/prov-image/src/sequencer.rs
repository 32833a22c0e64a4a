//! Parameter sequencer
//!
//! Keeps fleet-unique parameters (station address, hostname, access point
//! name) distinct between consecutive provisioning runs.

use std::net::Ipv4Addr;

use prov_core::{ProvisionError, ProvisionResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::settings::SettingsRecord;

/// How a sequenced field is incremented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKind {
    /// Dotted IPv4 address, last octet is the counter; empty means DHCP
    Ipv4LastOctet,
    /// Text with a trailing decimal counter, e.g. `drone7`
    NumericSuffix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedField {
    pub name: String,
    pub kind: FieldKind,
}

impl SequencedField {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Sequencer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Lowest device index to hand out; the stored record takes over once
    /// its counters reach it
    #[serde(default)]
    pub start_index: Option<u32>,
    #[serde(default = "default_fields")]
    pub fields: Vec<SequencedField>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_index: None,
            fields: default_fields(),
        }
    }
}

pub fn default_fields() -> Vec<SequencedField> {
    vec![
        SequencedField::new("ip_sta", FieldKind::Ipv4LastOctet),
        SequencedField::new("wifi_hostname", FieldKind::NumericSuffix),
        SequencedField::new("ssid_ap", FieldKind::NumericSuffix),
    ]
}

/// Increment every sequenced field by one relative to `record`
pub fn advance(record: &SettingsRecord, fields: &[SequencedField]) -> ProvisionResult<SettingsRecord> {
    let mut next = record.clone();
    for field in fields {
        let current = value_of(record, &field.name)?;
        let value = match field.kind {
            FieldKind::Ipv4LastOctet => step_ipv4(&field.name, current, None)?,
            FieldKind::NumericSuffix => step_suffix(&field.name, current, None)?,
        };
        debug!(field = %field.name, from = %current, to = %value, "Advanced parameter");
        next.set(&field.name, value)?;
    }
    Ok(next)
}

/// Set every sequenced field to device `index`
///
/// The address gets `index` as its last octet; names get their alphabetic
/// base followed by `index`.
pub fn assign(
    record: &SettingsRecord,
    fields: &[SequencedField],
    index: u32,
) -> ProvisionResult<SettingsRecord> {
    let mut next = record.clone();
    for field in fields {
        let current = value_of(record, &field.name)?;
        let value = match field.kind {
            FieldKind::Ipv4LastOctet => step_ipv4(&field.name, current, Some(index))?,
            FieldKind::NumericSuffix => step_suffix(&field.name, current, Some(index))?,
        };
        next.set(&field.name, value)?;
    }
    Ok(next)
}

/// Sequence `record` for the next run
///
/// Values advance from `record`, except that they jump to device `start`
/// while every counter in `record` is still below it.
pub fn next_run(
    record: &SettingsRecord,
    fields: &[SequencedField],
    start: Option<u32>,
) -> ProvisionResult<SettingsRecord> {
    match start {
        Some(start) if highest_counter(record, fields).map_or(true, |n| n < u64::from(start)) => {
            assign(record, fields, start)
        }
        _ => advance(record, fields),
    }
}

fn highest_counter(record: &SettingsRecord, fields: &[SequencedField]) -> Option<u64> {
    fields
        .iter()
        .filter_map(|field| {
            let value = record.get(&field.name)?.trim();
            match field.kind {
                FieldKind::Ipv4LastOctet => value
                    .parse::<Ipv4Addr>()
                    .ok()
                    .map(|addr| u64::from(addr.octets()[3])),
                FieldKind::NumericSuffix => {
                    let base = value.trim_end_matches(|c: char| c.is_ascii_digit());
                    value[base.len()..].parse().ok()
                }
            }
        })
        .max()
}

/// Apply operator supplied values, validating address fields
pub fn apply_overrides(
    record: &mut SettingsRecord,
    fields: &[SequencedField],
    overrides: &[(String, String)],
) -> ProvisionResult<()> {
    for (name, value) in overrides {
        let is_address = fields
            .iter()
            .any(|f| &f.name == name && f.kind == FieldKind::Ipv4LastOctet);
        if is_address && !value.is_empty() && value.parse::<Ipv4Addr>().is_err() {
            return Err(ProvisionError::validation(format!(
                "'{}' is not a valid IPv4 address for '{}'",
                value, name
            )));
        }
        record.set(name, value.clone())?;
    }
    Ok(())
}

fn value_of<'a>(record: &'a SettingsRecord, name: &str) -> ProvisionResult<&'a str> {
    record.get(name).ok_or_else(|| {
        ProvisionError::validation(format!("sequenced parameter '{}' is absent", name))
    })
}

fn step_ipv4(name: &str, current: &str, index: Option<u32>) -> ProvisionResult<String> {
    if current.trim().is_empty() {
        return Ok(String::new());
    }
    let addr: Ipv4Addr = current.trim().parse().map_err(|_| {
        ProvisionError::validation(format!("'{}' of '{}' is not an IPv4 address", current, name))
    })?;
    let [a, b, c, d] = addr.octets();
    let octet = match index {
        Some(i) => i,
        None => u32::from(d) + 1,
    };
    if !(1..=254).contains(&octet) {
        return Err(ProvisionError::validation(format!(
            "'{}' cannot take host number {}",
            name, octet
        )));
    }
    Ok(Ipv4Addr::new(a, b, c, octet as u8).to_string())
}

fn step_suffix(name: &str, current: &str, index: Option<u32>) -> ProvisionResult<String> {
    let base = current.trim_end_matches(|c: char| c.is_ascii_digit());
    if base.is_empty() && index.is_none() {
        return Err(ProvisionError::validation(format!(
            "'{}' of '{}' has no name part to sequence",
            current, name
        )));
    }
    let digits = &current[base.len()..];
    let next = match index {
        Some(i) => u64::from(i),
        None if digits.is_empty() => 1,
        None => {
            let n: u64 = digits.parse().map_err(|_| {
                ProvisionError::validation(format!("counter of '{}' is too large", name))
            })?;
            n.checked_add(1).ok_or_else(|| {
                ProvisionError::validation(format!("counter of '{}' is too large", name))
            })?
        }
    };
    match index {
        // Keep zero padding when advancing, e.g. node09 -> node10
        None => Ok(format!("{}{:0width$}", base, next, width = digits.len())),
        Some(_) => Ok(format!("{}{}", base, next)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record() -> SettingsRecord {
        SettingsRecord::parse(
            "key,type,encoding,value\nsettings,namespace,,\nip_sta,data,string,192.168.50.10\nwifi_hostname,data,string,drone09\nssid_ap,data,string,DroneBridge\n",
        )
        .unwrap()
    }

    #[test]
    fn test_advance() {
        let next = advance(&record(), &default_fields()).unwrap();
        assert_eq!(next.get("ip_sta"), Some("192.168.50.11"));
        assert_eq!(next.get("wifi_hostname"), Some("drone10"));
        assert_eq!(next.get("ssid_ap"), Some("DroneBridge1"));
    }

    #[test]
    fn test_advance_twice_never_collides() {
        let base = record();
        let first = advance(&base, &default_fields()).unwrap();
        let second = advance(&first, &default_fields()).unwrap();
        for field in default_fields() {
            assert_ne!(first.get(&field.name), second.get(&field.name));
            assert_ne!(base.get(&field.name), first.get(&field.name));
        }
    }

    #[test]
    fn test_assign_index() {
        let next = assign(&record(), &default_fields(), 7).unwrap();
        assert_eq!(next.get("ip_sta"), Some("192.168.50.7"));
        assert_eq!(next.get("wifi_hostname"), Some("drone7"));
        assert_eq!(next.get("ssid_ap"), Some("DroneBridge7"));
        assert!(assign(&record(), &default_fields(), 255).is_err());
    }

    #[test]
    fn test_next_run_starts_at_index_then_advances() {
        let fields = default_fields();
        let first = next_run(&record(), &fields, Some(30)).unwrap();
        assert_eq!(first.get("ip_sta"), Some("192.168.50.30"));
        assert_eq!(first.get("wifi_hostname"), Some("drone30"));

        let second = next_run(&first, &fields, Some(30)).unwrap();
        assert_eq!(second.get("ip_sta"), Some("192.168.50.31"));
        assert_eq!(second.get("ssid_ap"), Some("DroneBridge31"));

        // Already past the start index
        let below = next_run(&record(), &fields, Some(5)).unwrap();
        assert_eq!(below.get("ip_sta"), Some("192.168.50.11"));
        assert_eq!(next_run(&record(), &fields, None).unwrap(), advance(&record(), &fields).unwrap());
    }

    #[test]
    fn test_empty_address_stays_empty() {
        let mut r = record();
        r.set("ip_sta", "").unwrap();
        let next = advance(&r, &default_fields()).unwrap();
        assert_eq!(next.get("ip_sta"), Some(""));
    }

    #[test]
    fn test_absent_or_malformed_field() {
        let fields = vec![SequencedField::new("missing", FieldKind::NumericSuffix)];
        assert!(matches!(advance(&record(), &fields), Err(ProvisionError::Validation(_))));

        let mut r = record();
        r.set("ip_sta", "not-an-ip").unwrap();
        assert!(advance(&r, &default_fields()).is_err());

        r.set("ip_sta", "10.0.0.254").unwrap();
        assert!(advance(&r, &default_fields()).is_err());
    }

    #[test]
    fn test_overrides_validate_addresses() {
        let mut r = record();
        let bad = vec![("ip_sta".to_string(), "300.1.1.1".to_string())];
        assert!(apply_overrides(&mut r, &default_fields(), &bad).is_err());

        let good = vec![
            ("ip_sta".to_string(), "10.1.1.1".to_string()),
            ("wifi_hostname".to_string(), "bench".to_string()),
        ];
        apply_overrides(&mut r, &default_fields(), &good).unwrap();
        assert_eq!(r.get("ip_sta"), Some("10.1.1.1"));
        assert_eq!(r.get("wifi_hostname"), Some("bench"));
    }

    #[test]
    fn test_config_kinds_deserialize() {
        let field: SequencedField =
            serde_yaml::from_str("name: ip_sta\nkind: ipv4-last-octet\n").unwrap();
        assert_eq!(field.kind, FieldKind::Ipv4LastOctet);
    }
}
