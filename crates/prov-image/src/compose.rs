//! Image composition
//!
//! Places firmware binaries, the encoded settings record and the license at
//! the offsets of a partition map. The buffer spans from the lowest region
//! offset to the highest region end; bytes not covered by a payload keep
//! the fill value. Composition is pure: identical inputs give identical
//! bytes.

use std::collections::BTreeMap;

use bytes::Bytes;
use prov_core::{License, PartitionErrorKind, ProvisionError, ProvisionResult};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::codec;
use crate::partition::{PartitionMap, RegionContent};
use crate::settings::SettingsRecord;

/// Erased flash value
pub const DEFAULT_FILL: u8 = 0xFF;

/// Where a payload ended up in the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub region: String,
    pub content: RegionContent,
    /// Absolute flash offset
    pub offset: u32,
    /// Payload length, without padding
    pub len: usize,
    pub capacity: u32,
}

/// A composed, immutable flash image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionImage {
    base_offset: u32,
    data: Bytes,
    placements: Vec<Placement>,
}

impl PartitionImage {
    /// Flash offset of the first image byte
    pub fn base_offset(&self) -> u32 {
        self.base_offset
    }

    /// Image content, cheap to clone and share
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub fn placement(&self, region: &str) -> Option<&Placement> {
        self.placements.iter().find(|p| p.region == region)
    }

    /// Payload written to `region`, without padding
    pub fn payload(&self, region: &str) -> Option<Bytes> {
        let p = self.placement(region)?;
        let start = (p.offset - self.base_offset) as usize;
        Some(self.data.slice(start..start + p.len))
    }

    /// Whole region including padding
    pub fn region_bytes(&self, region: &str) -> Option<Bytes> {
        let p = self.placement(region)?;
        let start = (p.offset - self.base_offset) as usize;
        Some(self.data.slice(start..start + p.capacity as usize))
    }

    /// Decode the settings region back into a record
    pub fn decode_settings(&self) -> ProvisionResult<SettingsRecord> {
        let region = self
            .placements
            .iter()
            .find(|p| p.content == RegionContent::Settings)
            .map(|p| p.region.clone())
            .ok_or_else(|| ProvisionError::validation("image has no settings region"))?;
        let bytes = self
            .region_bytes(&region)
            .ok_or_else(|| ProvisionError::validation("image has no settings region"))?;
        codec::decode(&bytes)
    }

    /// SHA-256 of the whole image
    pub fn sha256(&self) -> [u8; 32] {
        Sha256::digest(&self.data).into()
    }
}

/// Compose an image
///
/// `firmware` maps firmware region names to binaries. A license region in
/// the map requires `license`.
pub fn compose(
    map: &PartitionMap,
    firmware: &BTreeMap<String, Vec<u8>>,
    settings: &SettingsRecord,
    license: Option<&License>,
) -> ProvisionResult<PartitionImage> {
    compose_with_fill(map, firmware, settings, license, DEFAULT_FILL)
}

/// Compose an image with a custom fill byte
pub fn compose_with_fill(
    map: &PartitionMap,
    firmware: &BTreeMap<String, Vec<u8>>,
    settings: &SettingsRecord,
    license: Option<&License>,
    fill: u8,
) -> ProvisionResult<PartitionImage> {
    map.validate()?;

    let mut regions: Vec<_> = map.regions.iter().collect();
    regions.sort_by_key(|r| r.offset);

    // validate() guarantees at least one region, all ending within u32 flash
    let base = regions.first().map(|r| r.offset).unwrap_or(0);
    let end = regions.iter().map(|r| r.end()).max().unwrap_or(u64::from(base));
    let mut buf = vec![fill; (end - u64::from(base)) as usize];
    let mut placements = Vec::with_capacity(regions.len());

    for region in regions {
        let payload: Vec<u8> = match region.content {
            RegionContent::Firmware => firmware.get(&region.name).cloned().ok_or_else(|| {
                ProvisionError::partition(
                    PartitionErrorKind::MissingPayload,
                    region.name.as_str(),
                    "no firmware binary supplied",
                )
            })?,
            RegionContent::Settings => codec::encode(settings)?,
            RegionContent::License => {
                let license = license.ok_or_else(|| {
                    ProvisionError::partition(
                        PartitionErrorKind::MissingPayload,
                        region.name.as_str(),
                        "no license supplied",
                    )
                })?;
                encode_license(license)?
            }
        };

        if payload.len() > region.size as usize {
            return Err(ProvisionError::partition(
                PartitionErrorKind::RegionOverflow,
                region.name.as_str(),
                format!(
                    "payload of {} bytes exceeds capacity of {} bytes",
                    payload.len(),
                    region.size
                ),
            ));
        }

        let start = (region.offset - base) as usize;
        buf[start..start + payload.len()].copy_from_slice(&payload);
        debug!(
            region = %region.name,
            offset = %format!("0x{:x}", region.offset),
            len = payload.len(),
            capacity = region.size,
            "Placed payload"
        );
        placements.push(Placement {
            region: region.name.clone(),
            content: region.content,
            offset: region.offset,
            len: payload.len(),
            capacity: region.size,
        });
    }

    Ok(PartitionImage {
        base_offset: base,
        data: Bytes::from(buf),
        placements,
    })
}

/// License region payload: u32 LE length followed by the blob
pub fn encode_license(license: &License) -> ProvisionResult<Vec<u8>> {
    let len = u32::try_from(license.blob().len())
        .map_err(|_| ProvisionError::validation("license blob too large"))?;
    let mut out = Vec::with_capacity(4 + license.blob().len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(license.blob());
    Ok(out)
}

/// Read a license region payload
pub fn decode_license(region: &[u8]) -> Option<Vec<u8>> {
    let header: [u8; 4] = region.get(..4)?.try_into().ok()?;
    let len = u32::from_le_bytes(header) as usize;
    if len == 0 || len == u32::MAX as usize {
        return None;
    }
    region.get(4..4 + len).map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Region;
    use pretty_assertions::assert_eq;
    use prov_core::ActivationKey;

    fn map() -> PartitionMap {
        PartitionMap::new(
            0x10000,
            vec![
                Region::new("boot", 0x1000, 0x100, RegionContent::Firmware),
                Region::new("settings", 0x2000, 0x400, RegionContent::Settings),
                Region::new("license", 0x2400, 0x100, RegionContent::License),
                Region::new("app", 0x3000, 0x200, RegionContent::Firmware),
            ],
        )
    }

    fn firmware() -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            ("boot".to_string(), vec![0xB0; 0x80]),
            ("app".to_string(), vec![0xA9; 0x200]),
        ])
    }

    fn settings() -> SettingsRecord {
        SettingsRecord::parse("key,type,encoding,value\nsettings,namespace,,\nip_sta,data,string,10.0.0.2\n")
            .unwrap()
    }

    fn license() -> License {
        License::new(ActivationKey::from_bytes([9; 32]), b"signed".to_vec()).unwrap()
    }

    #[test]
    fn test_layout_and_padding() {
        let image = compose(&map(), &firmware(), &settings(), Some(&license())).unwrap();
        assert_eq!(image.base_offset(), 0x1000);
        assert_eq!(image.len(), 0x3200 - 0x1000);

        let data = image.bytes();
        assert_eq!(data[0], 0xB0);
        assert_eq!(data[0x80], DEFAULT_FILL);
        // Gap between regions keeps the fill value
        assert_eq!(data[0x200], DEFAULT_FILL);
        assert_eq!(image.payload("app").unwrap().len(), 0x200);
        assert_eq!(
            decode_license(&image.region_bytes("license").unwrap()),
            Some(b"signed".to_vec())
        );
        assert_eq!(image.decode_settings().unwrap(), settings());
    }

    #[test]
    fn test_exact_fit_succeeds_and_overflow_names_region() {
        // app payload exactly fills its region
        assert!(compose(&map(), &firmware(), &settings(), Some(&license())).is_ok());

        let mut too_big = firmware();
        too_big.insert("app".to_string(), vec![0; 0x201]);
        let err = compose(&map(), &too_big, &settings(), Some(&license())).unwrap_err();
        match err {
            ProvisionError::PartitionBuild { kind, region, .. } => {
                assert_eq!(kind, PartitionErrorKind::RegionOverflow);
                assert_eq!(region, "app");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_missing_payloads() {
        let mut partial = firmware();
        partial.remove("boot");
        assert!(compose(&map(), &partial, &settings(), Some(&license())).is_err());
        assert!(compose(&map(), &firmware(), &settings(), None).is_err());
    }

    #[test]
    fn test_custom_fill() {
        let image = compose_with_fill(&map(), &firmware(), &settings(), Some(&license()), 0x00).unwrap();
        assert_eq!(image.bytes()[0x80], 0x00);
    }
}
