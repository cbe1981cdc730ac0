//! On-disk record framing: the byte-exact layout written to a truck's
//! `.dat` file and read back during normal reads and crash recovery.

use bytes::{Bytes, BytesMut};

use crate::crc32;
use crate::error::TruckDbError;

pub const MAGIC_V1: u8 = 0xDB;
pub const MAGIC_V2: u8 = 0xDC;

/// Reserved box used to frame a batch's transaction envelope. User boxes
/// must not use this name.
pub const SYS_BOX: &str = "__SYS__";
pub const TX_START_PREFIX: &str = "TX_START_";
pub const TX_COMMIT_PREFIX: &str = "TX_COMMIT_";

/// The maximum length accepted for a box id or tag before the recovery
/// scan treats the record as corrupt and advances one byte.
pub const MAX_ID_LEN: u32 = 1024;

/// One (box, tag, value?) record as it appears on disk, independent of
/// framing version. `data` is empty for a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub box_id: String,
    pub tag: String,
    pub data: Bytes,
}

impl Record {
    pub fn new(box_id: impl Into<String>, tag: impl Into<String>, data: Bytes) -> Self {
        Self {
            box_id: box_id.into(),
            tag: tag.into(),
            data,
        }
    }

    pub fn tombstone(box_id: impl Into<String>, tag: impl Into<String>) -> Self {
        Self::new(box_id, tag, Bytes::new())
    }

    pub fn is_tombstone(&self) -> bool {
        self.data.is_empty()
    }

    /// Serializes this record using V2 framing (magic + body + trailing CRC).
    /// Writers always emit V2; only readers accept V1.
    pub fn to_bytes_v2(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            1 + 4 + self.box_id.len() + 4 + self.tag.len() + 4 + self.data.len() + 4,
        );
        write_body(&mut buf, MAGIC_V2, &self.box_id, &self.tag, &self.data);
        let crc = crc32::crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.freeze()
    }

    /// Parses one record starting at the beginning of `data`. Returns the
    /// record and the number of bytes consumed.
    ///
    /// This is the strict decode path used by normal reads: any framing
    /// violation is an error, not a byte-advance retry (that tolerance
    /// belongs to the recovery scan in `truck.rs`).
    pub fn from_bytes(data: &[u8]) -> Result<(Record, usize), TruckDbError> {
        if data.is_empty() {
            return Err(TruckDbError::IntegrityError {
                reason: "empty record buffer".to_string(),
            });
        }
        let magic = data[0];
        let versioned = match magic {
            MAGIC_V1 => false,
            MAGIC_V2 => true,
            other => {
                return Err(TruckDbError::IntegrityError {
                    reason: format!("unrecognized magic byte 0x{other:02X}"),
                });
            }
        };

        let mut pos = 1usize;
        let box_id = read_len_prefixed_string(data, &mut pos)?;
        let tag = read_len_prefixed_string(data, &mut pos)?;
        let data_len = read_u32(data, &mut pos)? as usize;
        if pos + data_len > data.len() {
            return Err(TruckDbError::IntegrityError {
                reason: "record payload exceeds buffer".to_string(),
            });
        }
        let payload = Bytes::copy_from_slice(&data[pos..pos + data_len]);
        pos += data_len;

        if versioned {
            if pos + 4 > data.len() {
                return Err(TruckDbError::IntegrityError {
                    reason: "missing CRC trailer".to_string(),
                });
            }
            let stored_crc = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
            let computed_crc = crc32::crc32(&data[..pos]);
            if stored_crc != computed_crc {
                return Err(TruckDbError::IntegrityError {
                    reason: format!(
                        "CRC mismatch: stored=0x{stored_crc:08X} computed=0x{computed_crc:08X}"
                    ),
                });
            }
            pos += 4;
        }

        Ok((
            Record {
                box_id,
                tag,
                data: payload,
            },
            pos,
        ))
    }
}

fn write_body(buf: &mut BytesMut, magic: u8, box_id: &str, tag: &str, data: &[u8]) {
    use bytes::BufMut;
    buf.put_u8(magic);
    buf.put_u32_le(box_id.len() as u32);
    buf.put_slice(box_id.as_bytes());
    buf.put_u32_le(tag.len() as u32);
    buf.put_slice(tag.as_bytes());
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32, TruckDbError> {
    if *pos + 4 > data.len() {
        return Err(TruckDbError::IntegrityError {
            reason: "truncated length prefix".to_string(),
        });
    }
    let v = u32::from_le_bytes(data[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn read_len_prefixed_string(data: &[u8], pos: &mut usize) -> Result<String, TruckDbError> {
    let len = read_u32(data, pos)? as usize;
    if *pos + len > data.len() {
        return Err(TruckDbError::IntegrityError {
            reason: "truncated string payload".to_string(),
        });
    }
    let s = String::from_utf8(data[*pos..*pos + len].to_vec()).map_err(|_| {
        TruckDbError::IntegrityError {
            reason: "invalid UTF-8 in record id".to_string(),
        }
    })?;
    *pos += len;
    Ok(s)
}

/// Builds the TX_START record for a batch of `count` entries under the
/// monotonic transaction id `tx_id`.
pub fn tx_start(tx_id: u64, count: usize) -> Record {
    let payload = crate::value::Value::Map(vec![("count".to_string(), crate::value::Value::Int(count as i64))]);
    Record::new(SYS_BOX, format!("{TX_START_PREFIX}{tx_id}"), payload.encode())
}

/// Builds the TX_COMMIT record closing transaction `tx_id`.
pub fn tx_commit(tx_id: u64) -> Record {
    Record::tombstone(SYS_BOX, format!("{TX_COMMIT_PREFIX}{tx_id}"))
}

pub fn is_tx_start(box_id: &str, tag: &str) -> Option<&str> {
    if box_id == SYS_BOX {
        tag.strip_prefix(TX_START_PREFIX)
    } else {
        None
    }
}

pub fn is_tx_commit(box_id: &str, tag: &str) -> Option<&str> {
    if box_id == SYS_BOX {
        tag.strip_prefix(TX_COMMIT_PREFIX)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn v2_roundtrip() {
        let record = Record::new("users", "u1", Bytes::from_static(b"payload"));
        let bytes = record.to_bytes_v2();
        let (decoded, consumed) = Record::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn v2_tombstone_has_empty_data() {
        let record = Record::tombstone("users", "u1");
        assert!(record.is_tombstone());
        let bytes = record.to_bytes_v2();
        let (decoded, _) = Record::from_bytes(&bytes).unwrap();
        assert!(decoded.is_tombstone());
    }

    #[test]
    fn v1_framing_has_no_crc_trailer() {
        let box_id = "users";
        let tag = "u1";
        let data = b"payload";
        let mut buf = BytesMut::new();
        write_body(&mut buf, MAGIC_V1, box_id, tag, data);
        let (decoded, consumed) = Record::from_bytes(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded.box_id, box_id);
        assert_eq!(decoded.tag, tag);
        assert_eq!(&decoded.data[..], data);
    }

    #[test]
    fn crc_mismatch_is_integrity_error() {
        let record = Record::new("users", "u1", Bytes::from_static(b"payload"));
        let mut bytes = record.to_bytes_v2().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = Record::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, TruckDbError::IntegrityError { .. }));
    }

    #[test_case(0x00; "zero byte")]
    #[test_case(0xFF; "arbitrary byte")]
    fn unrecognized_magic_is_rejected(byte: u8) {
        let err = Record::from_bytes(&[byte, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, TruckDbError::IntegrityError { .. }));
    }

    #[test]
    fn tx_start_and_commit_are_recognized() {
        let start = tx_start(7, 3);
        let commit = tx_commit(7);
        assert_eq!(is_tx_start(&start.box_id, &start.tag), Some("7"));
        assert_eq!(is_tx_commit(&commit.box_id, &commit.tag), Some("7"));
        assert_eq!(is_tx_start("users", "TX_START_7"), None);
    }
}
