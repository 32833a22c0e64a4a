//! On-device encoding of a settings record
//!
//! # Wire format
//!
//! All integers are little endian.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Magic "PSET" (4)                        │
//! │  Format version (1)                      │
//! ├──────────────────────────────────────────┤
//! │  Preamble count (u16), each: str16       │
//! │  Column count (u16), each: str16         │
//! │  Line count (u32), each:                 │
//! │    tag 0 = row:     field count (u16),   │
//! │                     fields as str16      │
//! │    tag 1 = comment: str16                │
//! ├──────────────────────────────────────────┤
//! │  CRC-32 (ISO-HDLC) of everything above   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! `str16` is a u16 byte length followed by UTF-8 bytes. Bytes after the
//! CRC (region padding) are ignored on decode.

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use prov_core::{ProvisionError, ProvisionResult};

use crate::settings::{SettingsLine, SettingsRecord};

pub const SETTINGS_MAGIC: &[u8; 4] = b"PSET";
pub const SETTINGS_FORMAT_VERSION: u8 = 1;

const TAG_ROW: u8 = 0;
const TAG_COMMENT: u8 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Encode a settings record into its binary region payload
pub fn encode(record: &SettingsRecord) -> ProvisionResult<Vec<u8>> {
    let mut buf = BytesMut::new();
    buf.put_slice(SETTINGS_MAGIC);
    buf.put_u8(SETTINGS_FORMAT_VERSION);

    put_count16(&mut buf, record.preamble().len(), "preamble")?;
    for line in record.preamble() {
        put_str16(&mut buf, line)?;
    }

    put_count16(&mut buf, record.columns().len(), "columns")?;
    for column in record.columns() {
        put_str16(&mut buf, column)?;
    }

    let count = u32::try_from(record.lines().len())
        .map_err(|_| ProvisionError::validation("too many settings lines to encode"))?;
    buf.put_u32_le(count);
    for line in record.lines() {
        match line {
            SettingsLine::Row(row) => {
                buf.put_u8(TAG_ROW);
                put_count16(&mut buf, row.fields().len(), "fields")?;
                for field in row.fields() {
                    put_str16(&mut buf, field)?;
                }
            }
            SettingsLine::Comment(comment) => {
                buf.put_u8(TAG_COMMENT);
                put_str16(&mut buf, comment)?;
            }
        }
    }

    let crc = CRC32.checksum(&buf);
    buf.put_u32_le(crc);
    Ok(buf.to_vec())
}

/// Decode a settings region, ignoring trailing padding
pub fn decode(data: &[u8]) -> ProvisionResult<SettingsRecord> {
    let mut cur = data;

    let magic = take(&mut cur, SETTINGS_MAGIC.len())?;
    if magic != SETTINGS_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = get_u8(&mut cur)?;
    if version != SETTINGS_FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported format version {}", version)));
    }

    let preamble_len = get_u16(&mut cur)? as usize;
    let mut preamble = Vec::with_capacity(preamble_len);
    for _ in 0..preamble_len {
        preamble.push(get_str16(&mut cur)?);
    }

    let column_len = get_u16(&mut cur)? as usize;
    let mut columns = Vec::with_capacity(column_len);
    for _ in 0..column_len {
        columns.push(get_str16(&mut cur)?);
    }

    let line_len = get_u32(&mut cur)? as usize;
    let mut lines = Vec::new();
    for _ in 0..line_len {
        match get_u8(&mut cur)? {
            TAG_ROW => {
                let n = get_u16(&mut cur)? as usize;
                let mut fields = Vec::with_capacity(n);
                for _ in 0..n {
                    fields.push(get_str16(&mut cur)?);
                }
                lines.push(SettingsLine::Row(crate::settings::row_from_fields(fields)?));
            }
            TAG_COMMENT => lines.push(SettingsLine::Comment(get_str16(&mut cur)?)),
            tag => return Err(corrupt(&format!("unknown line tag {}", tag))),
        }
    }

    let body_len = data.len() - cur.len();
    let stored = get_u32(&mut cur)?;
    let computed = CRC32.checksum(&data[..body_len]);
    if stored != computed {
        return Err(corrupt(&format!(
            "checksum mismatch: stored {:08x}, computed {:08x}",
            stored, computed
        )));
    }

    SettingsRecord::from_parts(preamble, columns, lines)
}

fn corrupt(message: &str) -> ProvisionError {
    ProvisionError::validation(format!("corrupt settings region: {}", message))
}

fn put_count16(buf: &mut BytesMut, n: usize, what: &str) -> ProvisionResult<()> {
    let n = u16::try_from(n)
        .map_err(|_| ProvisionError::validation(format!("too many {} to encode", what)))?;
    buf.put_u16_le(n);
    Ok(())
}

fn put_str16(buf: &mut BytesMut, s: &str) -> ProvisionResult<()> {
    let len = u16::try_from(s.len()).map_err(|_| {
        ProvisionError::validation(format!("settings field of {} bytes is too long", s.len()))
    })?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn take<'a>(cur: &mut &'a [u8], n: usize) -> ProvisionResult<&'a [u8]> {
    if cur.len() < n {
        return Err(corrupt("truncated"));
    }
    let (head, tail) = cur.split_at(n);
    *cur = tail;
    Ok(head)
}

fn get_u8(cur: &mut &[u8]) -> ProvisionResult<u8> {
    if cur.remaining() < 1 {
        return Err(corrupt("truncated"));
    }
    Ok(cur.get_u8())
}

fn get_u16(cur: &mut &[u8]) -> ProvisionResult<u16> {
    if cur.remaining() < 2 {
        return Err(corrupt("truncated"));
    }
    Ok(cur.get_u16_le())
}

fn get_u32(cur: &mut &[u8]) -> ProvisionResult<u32> {
    if cur.remaining() < 4 {
        return Err(corrupt("truncated"));
    }
    Ok(cur.get_u32_le())
}

fn get_str16(cur: &mut &[u8]) -> ProvisionResult<String> {
    let len = get_u16(cur)? as usize;
    let bytes = take(cur, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("field is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> SettingsRecord {
        SettingsRecord::parse(
            "# header comment\nkey,type,encoding,value\nsettings,namespace,,\n\nip_sta,data,string,10.0.0.7\n",
        )
        .unwrap()
    }

    #[test]
    fn test_decode_recovers_record() {
        let record = sample();
        let mut region = encode(&record).unwrap();
        region.resize(region.len() + 64, 0xFF);
        assert_eq!(decode(&region).unwrap(), record);
    }

    #[test]
    fn test_corruption_detected() {
        let mut encoded = encode(&sample()).unwrap();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0x01;
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn test_truncated_and_foreign_data() {
        let encoded = encode(&sample()).unwrap();
        assert!(decode(&encoded[..encoded.len() - 2]).is_err());
        assert!(decode(&[0xFF; 32]).is_err());
        assert!(decode(&[]).is_err());
    }
}
