//! cinderdb: an embedded, log-structured key-value store.
//!
//! Writes go to a write-ahead log and an in-memory table, which is flushed
//! to sorted table files and merged down a leveled tree in the background.
//! Keys live in independent column families; reads can be pinned to a
//! snapshot.

pub mod batch;
pub mod cache;
pub mod compaction_filter;
pub mod comparator;
pub mod config;
pub mod db;
pub mod error;
pub mod filename;
pub mod flock;
pub mod hasher;
pub mod iterator;
pub mod lookup;
pub mod manifest;
pub mod memtable;
pub mod merge;
pub mod options_file;
pub mod scheduler;
pub mod snapshot;
pub mod sstable;
pub mod statistics;
pub mod table_cache;
pub mod tmpfs;
pub mod trace;
pub mod types;
pub mod version;
pub mod wal;

pub use batch::WriteBatch;
pub use compaction_filter::{CompactionFilter, Decision};
pub use comparator::{BytewiseComparator, Comparator, ReverseBytewiseComparator};
pub use config::{
    BottommostLevelCompaction, ColumnFamilyOptions, CompactRangeOptions, CompressionType, FlushOptions,
    IngestOptions, Options, ReadOptions, WalRecoveryMode, WriteOptions,
};
pub use db::{Checkpoint, ColumnFamilyDescriptor, ColumnFamilyHandle, Db, DbIterator, LiveFileMetaData, LogFile};
pub use error::{Code, Error, Result, SubCode};
pub use hasher::Hasher;
pub use merge::MergeOperator;
pub use snapshot::Snapshot;
pub use sstable::{SstFileReader, SstFileWriter};
pub use statistics::Ticker;
pub use types::SequenceNumber;
