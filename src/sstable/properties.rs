use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder};

use super::block::{Block, BlockBuilder};
use crate::error::Result;
use crate::types::SequenceNumber;
use crate::Error;

/// Summary written into every table file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableProperties {
    pub num_entries: u64,
    pub num_puts: u64,
    pub num_deletions: u64,
    pub num_merges: u64,
    pub num_range_deletions: u64,
    pub num_data_blocks: u64,
    pub raw_key_size: u64,
    pub raw_value_size: u64,
    pub data_size: u64,
    pub index_size: u64,
    pub filter_size: u64,
    pub smallest_seq: SequenceNumber,
    pub largest_seq: SequenceNumber,
    pub column_family_id: u32,
    pub creation_time: u64,
    pub comparator_name: String,
    pub compression_name: String,
    /// crc64 of every byte preceding the properties block.
    pub file_checksum: u64,
    /// Written outside a database; keys carry sequence zero until ingested.
    pub external_file: bool,
}

const U64_PROPERTIES: &[&str] = &[
    "cinderdb.column.family.id",
    "cinderdb.creation.time",
    "cinderdb.data.size",
    "cinderdb.external",
    "cinderdb.file.checksum",
    "cinderdb.filter.size",
    "cinderdb.index.size",
    "cinderdb.largest.seqno",
    "cinderdb.num.data.blocks",
    "cinderdb.num.deletions",
    "cinderdb.num.entries",
    "cinderdb.num.merge.operands",
    "cinderdb.num.puts",
    "cinderdb.num.range-deletions",
    "cinderdb.raw.key.size",
    "cinderdb.raw.value.size",
    "cinderdb.smallest.seqno",
];

impl TableProperties {
    fn numbers(&self) -> [u64; 17] {
        [
            self.column_family_id as u64,
            self.creation_time,
            self.data_size,
            self.external_file as u64,
            self.file_checksum,
            self.filter_size,
            self.index_size,
            self.largest_seq,
            self.num_data_blocks,
            self.num_deletions,
            self.num_entries,
            self.num_merges,
            self.num_puts,
            self.num_range_deletions,
            self.raw_key_size,
            self.raw_value_size,
            self.smallest_seq,
        ]
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut map: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
        for (name, value) in U64_PROPERTIES.iter().zip(self.numbers()) {
            let mut buf = [0u8; 8];
            BigEndian::write_u64(&mut buf, value);
            map.insert(*name, buf.to_vec());
        }
        map.insert("cinderdb.comparator", self.comparator_name.as_bytes().to_vec());
        map.insert("cinderdb.compression", self.compression_name.as_bytes().to_vec());

        let mut builder = BlockBuilder::new(1);
        for (name, value) in map {
            builder.add(name.as_bytes(), &value);
        }
        builder.finish()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let block = Block::decode(data)?;
        let mut props = TableProperties::default();
        for (name, value) in block.entries() {
            let name = std::str::from_utf8(name)
                .map_err(|_| Error::Corruption("non-utf8 property name".into()))?;
            match name {
                "cinderdb.comparator" => {
                    props.comparator_name = String::from_utf8_lossy(value).into_owned()
                }
                "cinderdb.compression" => {
                    props.compression_name = String::from_utf8_lossy(value).into_owned()
                }
                _ => {
                    if value.len() != 8 {
                        // unknown or malformed properties are skipped
                        continue;
                    }
                    let v = BigEndian::read_u64(value);
                    match name {
                        "cinderdb.column.family.id" => props.column_family_id = v as u32,
                        "cinderdb.creation.time" => props.creation_time = v,
                        "cinderdb.data.size" => props.data_size = v,
                        "cinderdb.external" => props.external_file = v != 0,
                        "cinderdb.file.checksum" => props.file_checksum = v,
                        "cinderdb.filter.size" => props.filter_size = v,
                        "cinderdb.index.size" => props.index_size = v,
                        "cinderdb.largest.seqno" => props.largest_seq = v,
                        "cinderdb.num.data.blocks" => props.num_data_blocks = v,
                        "cinderdb.num.deletions" => props.num_deletions = v,
                        "cinderdb.num.entries" => props.num_entries = v,
                        "cinderdb.num.merge.operands" => props.num_merges = v,
                        "cinderdb.num.puts" => props.num_puts = v,
                        "cinderdb.num.range-deletions" => props.num_range_deletions = v,
                        "cinderdb.raw.key.size" => props.raw_key_size = v,
                        "cinderdb.raw.value.size" => props.raw_value_size = v,
                        "cinderdb.smallest.seqno" => props.smallest_seq = v,
                        _ => {}
                    }
                }
            }
        }
        Ok(props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_decode_what_was_encoded() -> Result<()> {
        let props = TableProperties {
            num_entries: 10,
            num_puts: 7,
            num_deletions: 2,
            num_merges: 1,
            smallest_seq: 3,
            largest_seq: 42,
            column_family_id: 5,
            comparator_name: "cinderdb.BytewiseComparator".into(),
            compression_name: "zstd".into(),
            file_checksum: 0xDEAD_BEEF,
            external_file: true,
            ..Default::default()
        };
        assert_eq!(TableProperties::decode(&props.encode())?, props);
        Ok(())
    }
}
