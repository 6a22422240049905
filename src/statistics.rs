//! Engine-wide counters.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Ticker {
    KeysWritten,
    KeysRead,
    BytesWritten,
    BytesRead,
    MemtableHit,
    MemtableMiss,
    BlockCacheHit,
    BlockCacheMiss,
    BlockCacheAdd,
    BloomFilterUseful,
    WalSynced,
    WalBytes,
    WriteGroups,
    StallMicros,
    FlushBytes,
    CompactionBytesRead,
    CompactionBytesWritten,
    CompactionKeysDropped,
    NumberIterSeek,
}

const ALL: [Ticker; 19] = [
    Ticker::KeysWritten,
    Ticker::KeysRead,
    Ticker::BytesWritten,
    Ticker::BytesRead,
    Ticker::MemtableHit,
    Ticker::MemtableMiss,
    Ticker::BlockCacheHit,
    Ticker::BlockCacheMiss,
    Ticker::BlockCacheAdd,
    Ticker::BloomFilterUseful,
    Ticker::WalSynced,
    Ticker::WalBytes,
    Ticker::WriteGroups,
    Ticker::StallMicros,
    Ticker::FlushBytes,
    Ticker::CompactionBytesRead,
    Ticker::CompactionBytesWritten,
    Ticker::CompactionKeysDropped,
    Ticker::NumberIterSeek,
];

impl Ticker {
    pub fn name(self) -> &'static str {
        match self {
            Ticker::KeysWritten => "cinderdb.number.keys.written",
            Ticker::KeysRead => "cinderdb.number.keys.read",
            Ticker::BytesWritten => "cinderdb.bytes.written",
            Ticker::BytesRead => "cinderdb.bytes.read",
            Ticker::MemtableHit => "cinderdb.memtable.hit",
            Ticker::MemtableMiss => "cinderdb.memtable.miss",
            Ticker::BlockCacheHit => "cinderdb.block.cache.hit",
            Ticker::BlockCacheMiss => "cinderdb.block.cache.miss",
            Ticker::BlockCacheAdd => "cinderdb.block.cache.add",
            Ticker::BloomFilterUseful => "cinderdb.bloom.filter.useful",
            Ticker::WalSynced => "cinderdb.wal.synced",
            Ticker::WalBytes => "cinderdb.wal.bytes",
            Ticker::WriteGroups => "cinderdb.write.groups",
            Ticker::StallMicros => "cinderdb.stall.micros",
            Ticker::FlushBytes => "cinderdb.flush.write.bytes",
            Ticker::CompactionBytesRead => "cinderdb.compact.read.bytes",
            Ticker::CompactionBytesWritten => "cinderdb.compact.write.bytes",
            Ticker::CompactionKeysDropped => "cinderdb.compaction.keys.dropped",
            Ticker::NumberIterSeek => "cinderdb.number.db.seek",
        }
    }
}

#[derive(Debug, Default)]
pub struct Statistics {
    tickers: [AtomicU64; ALL.len()],
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ticker: Ticker, count: u64) {
        self.tickers[ticker as usize].fetch_add(count, Ordering::Relaxed);
    }

    /// Overwrites a ticker mirrored from another counter source.
    pub fn set(&self, ticker: Ticker, value: u64) {
        self.tickers[ticker as usize].store(value, Ordering::Relaxed);
    }

    pub fn get(&self, ticker: Ticker) -> u64 {
        self.tickers[ticker as usize].load(Ordering::Relaxed)
    }

    /// Every non-zero ticker as `name COUNT : n`, one per line.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for ticker in ALL {
            let value = self.get(ticker);
            if value > 0 {
                let _ = writeln!(out, "{} COUNT : {}", ticker.name(), value);
            }
        }
        out
    }

    pub fn log(&self) {
        tracing::info!(
            keys_written = self.get(Ticker::KeysWritten),
            keys_read = self.get(Ticker::KeysRead),
            memtable_hit = self.get(Ticker::MemtableHit),
            block_cache_hit = self.get(Ticker::BlockCacheHit),
            block_cache_miss = self.get(Ticker::BlockCacheMiss),
            bloom_useful = self.get(Ticker::BloomFilterUseful),
            stall_micros = self.get(Ticker::StallMicros),
            flush_bytes = self.get(Ticker::FlushBytes),
            compaction_bytes_written = self.get(Ticker::CompactionBytesWritten),
            "Engine statistics"
        );
    }
}
