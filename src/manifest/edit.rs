use super::meta::{read_bytes, write_bytes, FileMetaData};
use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

const COMPARATOR: u8 = 0x01;
const ADD_COLUMN_FAMILY: u8 = 0x02;
const DROP_COLUMN_FAMILY: u8 = 0x03;
const ADD_FILE: u8 = 0x04;
const DELETE_FILE: u8 = 0x05;
const LOG_NUMBER: u8 = 0x06;
const NEXT_FILE_NUMBER: u8 = 0x07;
const LAST_SEQUENCE: u8 = 0x08;
const MAX_COLUMN_FAMILY: u8 = 0x09;

#[derive(Debug, Clone, PartialEq)]
pub enum VersionEdit {
    Comparator {
        cf: u32,
        name: String,
    },

    AddColumnFamily {
        cf: u32,
        name: String,
    },

    DropColumnFamily {
        cf: u32,
    },

    AddFile {
        cf: u32,
        level: u32,
        meta: FileMetaData,
    },

    DeleteFile {
        cf: u32,
        level: u32,
        number: u64,
    },

    /// Logs older than `number` hold nothing unflushed for `cf`.
    LogNumber {
        cf: u32,
        number: u64,
    },

    NextFileNumber(u64),

    LastSequence(u64),

    MaxColumnFamily(u32),
}

impl VersionEdit {
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            VersionEdit::Comparator { cf, name } => {
                buf.write_u8(COMPARATOR)?;
                buf.write_u32::<BigEndian>(*cf)?;
                write_bytes(buf, name.as_bytes())?;
            }

            VersionEdit::AddColumnFamily { cf, name } => {
                buf.write_u8(ADD_COLUMN_FAMILY)?;
                buf.write_u32::<BigEndian>(*cf)?;
                write_bytes(buf, name.as_bytes())?;
            }

            VersionEdit::DropColumnFamily { cf } => {
                buf.write_u8(DROP_COLUMN_FAMILY)?;
                buf.write_u32::<BigEndian>(*cf)?;
            }

            VersionEdit::AddFile { cf, level, meta } => {
                buf.write_u8(ADD_FILE)?;
                buf.write_u32::<BigEndian>(*cf)?;
                buf.write_u32::<BigEndian>(*level)?;
                meta.encode_into(buf)?;
            }

            VersionEdit::DeleteFile { cf, level, number } => {
                buf.write_u8(DELETE_FILE)?;
                buf.write_u32::<BigEndian>(*cf)?;
                buf.write_u32::<BigEndian>(*level)?;
                buf.write_u64::<BigEndian>(*number)?;
            }

            VersionEdit::LogNumber { cf, number } => {
                buf.write_u8(LOG_NUMBER)?;
                buf.write_u32::<BigEndian>(*cf)?;
                buf.write_u64::<BigEndian>(*number)?;
            }

            VersionEdit::NextFileNumber(number) => {
                buf.write_u8(NEXT_FILE_NUMBER)?;
                buf.write_u64::<BigEndian>(*number)?;
            }

            VersionEdit::LastSequence(seq) => {
                buf.write_u8(LAST_SEQUENCE)?;
                buf.write_u64::<BigEndian>(*seq)?;
            }

            VersionEdit::MaxColumnFamily(cf) => {
                buf.write_u8(MAX_COLUMN_FAMILY)?;
                buf.write_u32::<BigEndian>(*cf)?;
            }
        }
        Ok(())
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let edit_type = cursor.read_u8()?;

        match edit_type {
            COMPARATOR => {
                let cf = cursor.read_u32::<BigEndian>()?;
                let name = read_string(cursor)?;
                Ok(VersionEdit::Comparator { cf, name })
            }

            ADD_COLUMN_FAMILY => {
                let cf = cursor.read_u32::<BigEndian>()?;
                let name = read_string(cursor)?;
                Ok(VersionEdit::AddColumnFamily { cf, name })
            }

            DROP_COLUMN_FAMILY => Ok(VersionEdit::DropColumnFamily {
                cf: cursor.read_u32::<BigEndian>()?,
            }),

            ADD_FILE => {
                let cf = cursor.read_u32::<BigEndian>()?;
                let level = cursor.read_u32::<BigEndian>()?;
                let meta = FileMetaData::decode_from(cursor)?;
                Ok(VersionEdit::AddFile { cf, level, meta })
            }

            DELETE_FILE => {
                let cf = cursor.read_u32::<BigEndian>()?;
                let level = cursor.read_u32::<BigEndian>()?;
                let number = cursor.read_u64::<BigEndian>()?;
                Ok(VersionEdit::DeleteFile { cf, level, number })
            }

            LOG_NUMBER => {
                let cf = cursor.read_u32::<BigEndian>()?;
                let number = cursor.read_u64::<BigEndian>()?;
                Ok(VersionEdit::LogNumber { cf, number })
            }

            NEXT_FILE_NUMBER => Ok(VersionEdit::NextFileNumber(
                cursor.read_u64::<BigEndian>()?,
            )),

            LAST_SEQUENCE => Ok(VersionEdit::LastSequence(cursor.read_u64::<BigEndian>()?)),

            MAX_COLUMN_FAMILY => Ok(VersionEdit::MaxColumnFamily(
                cursor.read_u32::<BigEndian>()?,
            )),

            _ => Err(Error::Corruption(format!(
                "invalid version edit type: {}",
                edit_type
            ))),
        }
    }
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    String::from_utf8(read_bytes(cursor)?)
        .map_err(|_| Error::Corruption("non-utf8 name in manifest".into()))
}

/// Edits that must be applied together or not at all. One group is one
/// manifest record.
pub fn encode_group(edits: &[VersionEdit]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(edits.len() as u32)?;
    for edit in edits {
        edit.encode_into(&mut buf)?;
    }
    Ok(buf)
}

pub fn decode_group(payload: &[u8]) -> Result<Vec<VersionEdit>> {
    let mut cursor = Cursor::new(payload);
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let mut edits = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        edits.push(VersionEdit::decode_from(&mut cursor)?);
    }
    if cursor.position() as usize != payload.len() {
        return Err(Error::Corruption("trailing bytes in manifest record".into()));
    }
    Ok(edits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InternalKey, ValueType};

    fn file(number: u64) -> FileMetaData {
        FileMetaData {
            number,
            file_size: 1024,
            smallest: InternalKey::new(b"a".to_vec(), 5, ValueType::Put),
            largest: InternalKey::new(b"m".to_vec(), 9, ValueType::Delete),
            smallest_seq: 5,
            largest_seq: 9,
            num_entries: 12,
            num_deletions: 2,
            num_range_deletions: 1,
            global_seqno: None,
        }
    }

    #[test]
    fn test_group_preserves_order_and_contents() -> Result<()> {
        let edits = vec![
            VersionEdit::AddColumnFamily {
                cf: 3,
                name: "users".into(),
            },
            VersionEdit::Comparator {
                cf: 3,
                name: "cinderdb.BytewiseComparator".into(),
            },
            VersionEdit::AddFile {
                cf: 3,
                level: 1,
                meta: file(17),
            },
            VersionEdit::DeleteFile {
                cf: 3,
                level: 0,
                number: 12,
            },
            VersionEdit::LogNumber { cf: 3, number: 16 },
            VersionEdit::NextFileNumber(18),
            VersionEdit::LastSequence(9),
            VersionEdit::MaxColumnFamily(3),
            VersionEdit::DropColumnFamily { cf: 2 },
        ];
        let decoded = decode_group(&encode_group(&edits)?)?;
        assert_eq!(decoded, edits);
        Ok(())
    }

    #[test]
    fn test_unknown_edit_type_is_corruption() {
        let payload = [0, 0, 0, 1, 0x7f];
        assert!(decode_group(&payload).unwrap_err().is_corruption());
    }

    #[test]
    fn test_truncated_group_fails() -> Result<()> {
        let encoded = encode_group(&[VersionEdit::AddFile {
            cf: 0,
            level: 0,
            meta: file(4),
        }])?;
        assert!(decode_group(&encoded[..encoded.len() - 3]).is_err());
        Ok(())
    }
}
