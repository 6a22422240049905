use crate::error::Result;
use crate::sstable::TableSummary;
use crate::types::{InternalKey, SequenceNumber};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Manifest entry for one table file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    /// Bounds include range tombstone extents.
    pub smallest: InternalKey,
    pub largest: InternalKey,
    pub smallest_seq: SequenceNumber,
    pub largest_seq: SequenceNumber,
    pub num_entries: u64,
    pub num_deletions: u64,
    pub num_range_deletions: u64,
    /// Set for ingested files; every key in the file reads at this sequence.
    pub global_seqno: Option<SequenceNumber>,
}

impl FileMetaData {
    pub fn from_table(number: u64, summary: &TableSummary) -> Self {
        let props = &summary.properties;
        Self {
            number,
            file_size: summary.file_size,
            smallest: summary.smallest.clone(),
            largest: summary.largest.clone(),
            smallest_seq: props.smallest_seq,
            largest_seq: props.largest_seq,
            num_entries: props.num_entries,
            num_deletions: props.num_deletions,
            num_range_deletions: props.num_range_deletions,
            global_seqno: None,
        }
    }

    /// Sequence number used to order L0 files, newest first.
    pub fn effective_largest_seq(&self) -> SequenceNumber {
        self.global_seqno.unwrap_or(self.largest_seq)
    }

    pub fn has_range_deletions(&self) -> bool {
        self.num_range_deletions > 0
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u64::<BigEndian>(self.number)?;
        buf.write_u64::<BigEndian>(self.file_size)?;
        write_bytes(buf, &self.smallest.encode())?;
        write_bytes(buf, &self.largest.encode())?;
        buf.write_u64::<BigEndian>(self.smallest_seq)?;
        buf.write_u64::<BigEndian>(self.largest_seq)?;
        buf.write_u64::<BigEndian>(self.num_entries)?;
        buf.write_u64::<BigEndian>(self.num_deletions)?;
        buf.write_u64::<BigEndian>(self.num_range_deletions)?;
        match self.global_seqno {
            Some(seq) => {
                buf.write_u8(1)?;
                buf.write_u64::<BigEndian>(seq)?;
            }
            None => buf.write_u8(0)?,
        }
        Ok(())
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let number = cursor.read_u64::<BigEndian>()?;
        let file_size = cursor.read_u64::<BigEndian>()?;
        let smallest = InternalKey::decode(&read_bytes(cursor)?)?;
        let largest = InternalKey::decode(&read_bytes(cursor)?)?;
        let smallest_seq = cursor.read_u64::<BigEndian>()?;
        let largest_seq = cursor.read_u64::<BigEndian>()?;
        let num_entries = cursor.read_u64::<BigEndian>()?;
        let num_deletions = cursor.read_u64::<BigEndian>()?;
        let num_range_deletions = cursor.read_u64::<BigEndian>()?;
        let global_seqno = match cursor.read_u8()? {
            0 => None,
            _ => Some(cursor.read_u64::<BigEndian>()?),
        };

        Ok(FileMetaData {
            number,
            file_size,
            smallest,
            largest,
            smallest_seq,
            largest_seq,
            num_entries,
            num_deletions,
            num_range_deletions,
            global_seqno,
        })
    }
}

pub(crate) fn write_bytes<W: Write>(buf: &mut W, data: &[u8]) -> Result<()> {
    buf.write_u32::<BigEndian>(data.len() as u32)?;
    buf.write_all(data)?;
    Ok(())
}

pub(crate) fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(crate::Error::Corruption(format!(
            "length {} overruns manifest record",
            len
        )));
    }
    let mut data = vec![0u8; len];
    cursor.read_exact(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ValueType;

    #[test]
    fn test_ingested_file_meta_survives_encoding() -> Result<()> {
        let meta = FileMetaData {
            number: 42,
            file_size: 4096,
            smallest: InternalKey::new(b"a".to_vec(), 0, ValueType::Put),
            largest: InternalKey::new(b"z".to_vec(), 0, ValueType::Delete),
            smallest_seq: 0,
            largest_seq: 0,
            num_entries: 10,
            num_deletions: 1,
            num_range_deletions: 0,
            global_seqno: Some(77),
        };
        let mut buf = Vec::new();
        meta.encode_into(&mut buf)?;
        let decoded = FileMetaData::decode_from(&mut Cursor::new(buf.as_slice()))?;
        assert_eq!(decoded, meta);
        assert_eq!(decoded.effective_largest_seq(), 77);
        Ok(())
    }

    #[test]
    fn test_oversized_length_is_corruption() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1000u32.to_be_bytes());
        buf.extend_from_slice(b"short");
        let err = read_bytes(&mut Cursor::new(buf.as_slice())).unwrap_err();
        assert!(err.is_corruption());
    }
}
