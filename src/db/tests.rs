use std::path::Path;
use std::sync::Arc;

use super::compaction::pick_compaction;
use super::*;
use crate::batch::WriteBatch;
use crate::comparator::reverse_bytewise;
use crate::config::{
    CompactRangeOptions, CompactionConfig, CompactionStyle, FlushOptions, IngestOptions, ReadOptions, WriteOptions,
};
use crate::error::{Code, SubCode};
use crate::merge::StringAppendOperator;
use crate::sstable::SstFileWriter;
use crate::tmpfs::TempDir;
use crate::trace::{FileTraceWriter, TraceOptions, TraceReader, TraceType};

fn test_options() -> Options {
    Options::default()
        .create_if_missing(true)
        .cf_options(ColumnFamilyOptions::default().disable_auto_compactions(true))
}

fn open_test_db(dir: &TempDir) -> Result<Db> {
    Db::open(&test_options(), dir.child("db"))
}

fn w() -> WriteOptions {
    WriteOptions::default()
}

fn r() -> ReadOptions {
    ReadOptions::default()
}

fn flush(db: &Db) -> Result<()> {
    db.flush(&FlushOptions::default())
}

fn collect_forward(iter: &mut DbIterator<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    iter.seek_to_first();
    while iter.valid() {
        out.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.next();
    }
    iter.status()?;
    Ok(out)
}

fn keys_of(entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<&[u8]> {
    entries.iter().map(|(k, _)| k.as_slice()).collect()
}

/// Copies the files of an open database, as a crash would leave them.
fn copy_live_files(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), to.join(entry.file_name()))?;
        }
    }
    Ok(())
}

#[test]
fn test_put_get_delete_survive_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let db = open_test_db(&dir)?;
        db.put(&w(), "alpha", "1")?;
        db.put(&w(), "beta", "2")?;
        db.put(&w(), "alpha", "3")?;
        db.delete(&w(), "beta")?;
        assert_eq!(db.get(&r(), "alpha")?, Some(b"3".to_vec()));
        assert_eq!(db.get(&r(), "beta")?, None);
        assert_eq!(db.get(&r(), "gamma")?, None);
        db.close()?;
    }

    let db = open_test_db(&dir)?;
    assert_eq!(db.get(&r(), "alpha")?, Some(b"3".to_vec()));
    assert_eq!(db.get(&r(), "beta")?, None);
    // the replayed log was written out as a level 0 table
    assert_eq!(db.int_property("cinderdb.num-files-at-level0")?, Some(1));
    Ok(())
}

#[test]
fn test_open_missing_database_requires_create_if_missing() -> Result<()> {
    let dir = TempDir::new()?;
    let err = Db::open(&Options::default(), dir.child("db")).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    drop(open_test_db(&dir)?);
    let err = Db::open(&test_options().error_if_exists(true), dir.child("db")).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn test_second_open_is_refused_while_locked() -> Result<()> {
    let dir = TempDir::new()?;
    let _db = open_test_db(&dir)?;
    assert!(open_test_db(&dir).is_err());
    Ok(())
}

#[test]
fn test_write_batch_applies_atomically() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "doomed", "x")?;

    let mut batch = WriteBatch::new();
    batch.put("a", "1");
    batch.put("b", "2");
    batch.delete("doomed");
    let seq = db.write(&w(), batch)?;
    assert_eq!(db.latest_sequence_number(), seq);

    assert_eq!(db.get(&r(), "a")?, Some(b"1".to_vec()));
    assert_eq!(db.get(&r(), "b")?, Some(b"2".to_vec()));
    assert_eq!(db.get(&r(), "doomed")?, None);
    Ok(())
}

#[test]
fn test_iterator_spans_memtable_and_tables() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "k1", "v1")?;
    db.put(&w(), "k3", "v3")?;
    db.put(&w(), "k5", "v5")?;
    flush(&db)?;
    db.put(&w(), "k2", "v2")?;
    db.put(&w(), "k4", "v4")?;
    db.delete(&w(), "k3")?;

    let mut iter = db.iterator(&r())?;
    let entries = collect_forward(&mut iter)?;
    assert_eq!(keys_of(&entries), vec![&b"k1"[..], b"k2", b"k4", b"k5"]);
    assert_eq!(entries[2].1, b"v4".to_vec());

    let mut reversed = Vec::new();
    iter.seek_to_last();
    while iter.valid() {
        reversed.push(iter.key().to_vec());
        iter.prev();
    }
    assert_eq!(reversed, vec![b"k5".to_vec(), b"k4".to_vec(), b"k2".to_vec(), b"k1".to_vec()]);

    iter.seek("k3");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"k4");
    iter.seek_for_prev("k3");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"k2");

    // direction changes step over the current key
    iter.seek("k2");
    iter.next();
    assert_eq!(iter.key(), b"k4");
    iter.prev();
    assert_eq!(iter.key(), b"k2");
    iter.prev();
    assert_eq!(iter.key(), b"k1");
    iter.next();
    assert_eq!(iter.key(), b"k2");

    iter.seek("zzz");
    assert!(!iter.valid());
    iter.status()?;
    Ok(())
}

#[test]
fn test_iterator_bounds() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    for key in ["a", "b", "c", "d", "e"] {
        db.put(&w(), key, key)?;
    }

    let opts = ReadOptions::new().iterate_lower_bound("b").iterate_upper_bound("d");
    let mut iter = db.iterator(&opts)?;
    let entries = collect_forward(&mut iter)?;
    assert_eq!(keys_of(&entries), vec![&b"b"[..], b"c"]);

    iter.seek_to_last();
    assert_eq!(iter.key(), b"c");
    iter.seek("a");
    assert_eq!(iter.key(), b"b");
    iter.seek("d");
    assert!(!iter.valid());
    Ok(())
}

#[test]
fn test_snapshot_isolation() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "k", "old")?;
    let snap = db.snapshot();
    db.put(&w(), "k", "new")?;
    db.put(&w(), "other", "x")?;

    let at_snap = ReadOptions::new().snapshot(&snap);
    assert_eq!(db.get(&at_snap, "k")?, Some(b"old".to_vec()));
    assert_eq!(db.get(&at_snap, "other")?, None);
    assert_eq!(db.get(&r(), "k")?, Some(b"new".to_vec()));
    assert_eq!(db.int_property("cinderdb.num-snapshots")?, Some(1));

    // compaction keeps the version the snapshot still sees
    db.compact_range(&CompactRangeOptions::default(), None, None)?;
    assert_eq!(db.get(&at_snap, "k")?, Some(b"old".to_vec()));
    let mut iter = db.iterator(&at_snap)?;
    let entries = collect_forward(&mut iter)?;
    assert_eq!(entries, vec![(b"k".to_vec(), b"old".to_vec())]);
    drop(iter);

    db.release_snapshot(snap);
    assert_eq!(db.int_property("cinderdb.num-snapshots")?, Some(0));
    Ok(())
}

#[test]
fn test_delete_range_hides_keys_before_and_after_flush() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    for key in ["a", "b", "c", "d"] {
        db.put(&w(), key, "v")?;
    }
    db.delete_range(&w(), "b", "d")?;
    db.put(&w(), "c", "again")?;

    let check = |db: &Db| -> Result<()> {
        assert_eq!(db.get(&r(), "a")?, Some(b"v".to_vec()));
        assert_eq!(db.get(&r(), "b")?, None);
        assert_eq!(db.get(&r(), "c")?, Some(b"again".to_vec()));
        assert_eq!(db.get(&r(), "d")?, Some(b"v".to_vec()));
        let mut iter = db.iterator(&r())?;
        let entries = collect_forward(&mut iter)?;
        assert_eq!(keys_of(&entries), vec![&b"a"[..], b"c", b"d"]);
        Ok(())
    };
    check(&db)?;
    flush(&db)?;
    check(&db)?;
    db.compact_range(&CompactRangeOptions::default(), None, None)?;
    check(&db)?;

    assert!(db.delete_range(&w(), "z", "a").is_err());
    Ok(())
}

#[test]
fn test_merge_operands_resolve_across_flush() -> Result<()> {
    let dir = TempDir::new()?;
    let cf_options = ColumnFamilyOptions::default()
        .disable_auto_compactions(true)
        .merge_operator(Arc::new(StringAppendOperator::default()));
    let options = Options::default().create_if_missing(true).cf_options(cf_options);
    let db = Db::open(&options, dir.child("db"))?;

    db.merge(&w(), "list", "a")?;
    db.merge(&w(), "list", "b")?;
    flush(&db)?;
    db.merge(&w(), "list", "c")?;
    assert_eq!(db.get(&r(), "list")?, Some(b"a,b,c".to_vec()));

    db.put(&w(), "reset", "base")?;
    db.merge(&w(), "reset", "tail")?;
    let mut iter = db.iterator(&r())?;
    let entries = collect_forward(&mut iter)?;
    assert_eq!(
        entries,
        vec![
            (b"list".to_vec(), b"a,b,c".to_vec()),
            (b"reset".to_vec(), b"base,tail".to_vec()),
        ]
    );
    drop(iter);

    db.compact_range(&CompactRangeOptions::default(), None, None)?;
    assert_eq!(db.get(&r(), "list")?, Some(b"a,b,c".to_vec()));
    assert_eq!(db.get(&r(), "reset")?, Some(b"base,tail".to_vec()));
    Ok(())
}

#[test]
fn test_merge_without_operator_is_rejected_on_read() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.merge(&w(), "k", "x")?;
    let err = db.get(&r(), "k").unwrap_err();
    assert_eq!(err.code(), Code::NotSupported);
    Ok(())
}

#[test]
fn test_compact_range_moves_data_down_and_drops_deletes() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "keep", "1")?;
    db.put(&w(), "gone", "2")?;
    flush(&db)?;
    db.delete(&w(), "gone")?;
    flush(&db)?;
    assert_eq!(db.int_property("cinderdb.num-files-at-level0")?, Some(2));

    db.compact_range(&CompactRangeOptions::default(), None, None)?;
    assert_eq!(db.int_property("cinderdb.num-files-at-level0")?, Some(0));
    assert_eq!(db.int_property("cinderdb.num-files-at-level1")?, Some(1));

    let meta = db.get_live_files_metadata()?;
    assert_eq!(meta.len(), 1);
    assert_eq!(meta[0].level, 1);
    assert_eq!(meta[0].num_entries, 1);
    assert_eq!(meta[0].smallest_key, b"keep".to_vec());
    assert_eq!(db.get(&r(), "gone")?, None);
    assert_eq!(db.get(&r(), "keep")?, Some(b"1".to_vec()));
    Ok(())
}

#[test]
fn test_compact_range_change_level_moves_output() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "a", "1")?;
    flush(&db)?;
    db.put(&w(), "b", "2")?;
    flush(&db)?;

    let opts = CompactRangeOptions::default().change_level(true).target_level(3);
    db.compact_range(&opts, None, None)?;
    assert_eq!(db.int_property("cinderdb.num-files-at-level1")?, Some(0));
    assert_eq!(db.int_property("cinderdb.num-files-at-level3")?, Some(1));
    assert_eq!(db.get(&r(), "b")?, Some(b"2".to_vec()));
    Ok(())
}

#[test]
fn test_compact_files_into_chosen_level() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "x", "1")?;
    flush(&db)?;
    db.put(&w(), "y", "2")?;
    flush(&db)?;

    let names: Vec<String> = db.get_live_files_metadata()?.into_iter().map(|m| m.name).collect();
    assert_eq!(names.len(), 2);
    let outputs = db.compact_files(&db.default_cf(), &names, 2)?;
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].ends_with(".sst"));

    let meta = db.get_live_files_metadata()?;
    assert_eq!(meta.len(), 1);
    assert_eq!(meta[0].level, 2);
    assert_eq!(meta[0].name, outputs[0]);
    assert_eq!(db.get(&r(), "x")?, Some(b"1".to_vec()));

    let err = db.compact_files(&db.default_cf(), &["999999.sst"], 1).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn test_paused_background_work_stops_manual_compaction() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "k", "v")?;
    flush(&db)?;

    db.pause_background_work()?;
    let err = db.compact_range(&CompactRangeOptions::default(), None, None).unwrap_err();
    assert_eq!(err.code(), Code::Incomplete);
    assert_eq!(err.subcode(), SubCode::ManualCompactionPaused);

    db.continue_background_work()?;
    db.compact_range(&CompactRangeOptions::default(), None, None)?;
    assert_eq!(db.get(&r(), "k")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn test_column_families_create_reopen_and_drop() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.child("db");
    {
        let db = Db::open(&test_options(), &path)?;
        let meta = db.create_column_family("meta", ColumnFamilyOptions::default())?;
        db.put_cf(&w(), &meta, "k", "in-meta")?;
        db.put(&w(), "k", "in-default")?;
        assert!(db.create_column_family("meta", ColumnFamilyOptions::default()).is_err());
        db.close()?;
    }

    let mut names = Db::list_column_families(&test_options(), &path)?;
    names.sort();
    assert_eq!(names, vec!["default".to_string(), "meta".to_string()]);

    let err = Db::open(&test_options(), &path).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let db = Db::open_cf(
        &test_options(),
        &path,
        vec![ColumnFamilyDescriptor::new("meta", ColumnFamilyOptions::default())],
    )?;
    let meta = db.cf_handle("meta").unwrap();
    assert_eq!(db.get_cf(&r(), &meta, "k")?, Some(b"in-meta".to_vec()));
    assert_eq!(db.get(&r(), "k")?, Some(b"in-default".to_vec()));

    db.drop_column_family(&meta)?;
    let err = db.put_cf(&w(), &meta, "k", "late").unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(db.cf_handle("meta").is_none());
    assert!(db.drop_column_family(&db.default_cf()).is_err());
    db.close()?;

    assert_eq!(Db::list_column_families(&test_options(), &path)?, vec!["default".to_string()]);
    Ok(())
}

#[test]
fn test_missing_column_families_need_opt_in() -> Result<()> {
    let dir = TempDir::new()?;
    let descriptors = || vec![ColumnFamilyDescriptor::new("extra", ColumnFamilyOptions::default())];

    let err = Db::open_cf(&test_options(), dir.child("one"), descriptors()).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let options = test_options().create_missing_column_families(true);
    let db = Db::open_cf(&options, dir.child("two"), descriptors())?;
    let extra = db.cf_handle("extra").unwrap();
    db.put_cf(&w(), &extra, "k", "v")?;
    assert_eq!(db.get_cf(&r(), &extra, "k")?, Some(b"v".to_vec()));
    assert_eq!(db.get(&r(), "k")?, None);
    assert_eq!(db.column_families()?.len(), 2);
    Ok(())
}

#[test]
fn test_multi_get_matches_individual_gets() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "a", "1")?;
    flush(&db)?;
    db.put(&w(), "c", "3")?;

    let results = db.multi_get(&r(), &["c", "b", "a"])?;
    let values: Vec<Option<Vec<u8>>> = results.into_iter().collect::<Result<_>>()?;
    assert_eq!(values, vec![Some(b"3".to_vec()), None, Some(b"1".to_vec())]);

    let cf = db.default_cf();
    let err = db.multi_get_cf(&r(), &[&cf], &["a", "c"]).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    Ok(())
}

#[test]
fn test_key_may_exist_never_misses() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "present", "1")?;
    assert!(db.key_may_exist(&r(), "present")?);
    flush(&db)?;
    assert!(db.key_may_exist(&r(), "present")?);
    Ok(())
}

#[test]
fn test_read_only_open_rejects_writes() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.child("db");
    {
        let db = Db::open(&test_options(), &path)?;
        db.put(&w(), "flushed", "1")?;
        flush(&db)?;
        db.put(&w(), "logged", "2")?;
        db.close()?;
    }

    let db = Db::open_read_only(&test_options(), &path, Vec::new())?;
    assert_eq!(db.get(&r(), "flushed")?, Some(b"1".to_vec()));
    assert_eq!(db.get(&r(), "logged")?, Some(b"2".to_vec()));
    assert_eq!(db.put(&w(), "k", "v").unwrap_err().code(), Code::NotSupported);
    assert_eq!(flush(&db).unwrap_err().code(), Code::NotSupported);
    assert_eq!(
        db.compact_range(&CompactRangeOptions::default(), None, None)
            .unwrap_err()
            .code(),
        Code::NotSupported
    );

    let err = Db::open_read_only(&test_options(), dir.child("nothing"), Vec::new()).unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    Ok(())
}

#[test]
fn test_secondary_catches_up_with_primary() -> Result<()> {
    let dir = TempDir::new()?;
    let primary_path = dir.child("primary");
    let primary = Db::open(&test_options(), &primary_path)?;
    primary.put(&w(), "a", "1")?;
    flush(&primary)?;
    primary.put(&w(), "b", "2")?;
    primary.flush_wal(true)?;

    let secondary = Db::open_as_secondary(&test_options(), &primary_path, dir.child("secondary"), Vec::new())?;
    assert_eq!(secondary.get(&r(), "a")?, Some(b"1".to_vec()));
    assert_eq!(secondary.get(&r(), "b")?, Some(b"2".to_vec()));
    assert!(secondary.put(&w(), "x", "y").is_err());

    primary.put(&w(), "c", "3")?;
    flush(&primary)?;
    primary.delete(&w(), "a")?;
    primary.flush_wal(true)?;
    assert_eq!(secondary.get(&r(), "c")?, None);

    secondary.try_catch_up_with_primary()?;
    assert_eq!(secondary.get(&r(), "c")?, Some(b"3".to_vec()));
    assert_eq!(secondary.get(&r(), "a")?, None);

    assert_eq!(primary.try_catch_up_with_primary().unwrap_err().code(), Code::NotSupported);
    Ok(())
}

#[test]
fn test_comparator_mismatch_on_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.child("db");
    let reversed = ColumnFamilyOptions::default().comparator(reverse_bytewise());
    {
        let db = Db::open(&Options::default().create_if_missing(true).cf_options(reversed.clone()), &path)?;
        for key in ["a", "b", "c"] {
            db.put(&w(), key, key)?;
        }
        let mut iter = db.iterator(&r())?;
        let entries = collect_forward(&mut iter)?;
        assert_eq!(keys_of(&entries), vec![&b"c"[..], b"b", b"a"]);
        drop(iter);
        db.close()?;
    }

    let err = Db::open(&test_options(), &path).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let db = Db::open(&Options::default().cf_options(reversed), &path)?;
    assert_eq!(db.get(&r(), "b")?, Some(b"b".to_vec()));
    Ok(())
}

#[test]
fn test_checkpoint_opens_as_independent_database() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "flushed", "1")?;
    flush(&db)?;
    db.put(&w(), "logged", "2")?;

    let target = dir.child("ckpt");
    Checkpoint::new(&db)?.create_checkpoint(&target)?;
    assert!(Checkpoint::new(&db)?.create_checkpoint(&target).is_err());
    assert_eq!(db.int_property("cinderdb.is-file-deletions-enabled")?, Some(1));

    db.put(&w(), "after", "3")?;
    let copy = Db::open(&test_options(), &target)?;
    assert_eq!(copy.get(&r(), "flushed")?, Some(b"1".to_vec()));
    assert_eq!(copy.get(&r(), "logged")?, Some(b"2".to_vec()));
    assert_eq!(copy.get(&r(), "after")?, None);

    copy.put(&w(), "flushed", "changed")?;
    assert_eq!(db.get(&r(), "flushed")?, Some(b"1".to_vec()));
    Ok(())
}

#[test]
fn test_ingest_external_file() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "m1", "stale")?;

    let file = dir.child("bulk.sst");
    let mut writer = SstFileWriter::create(&ColumnFamilyOptions::default(), &file)?;
    writer.put("m1", "fresh")?;
    writer.put("m2", "new")?;
    writer.finish()?;

    let strict = IngestOptions::default().allow_blocking_flush(false);
    let err = db.ingest_external_file(&strict, &[&file]).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let before = db.latest_sequence_number();
    db.ingest_external_file(&IngestOptions::default(), &[&file])?;
    assert_eq!(db.latest_sequence_number(), before + 1);
    assert_eq!(db.get(&r(), "m1")?, Some(b"fresh".to_vec()));
    assert_eq!(db.get(&r(), "m2")?, Some(b"new".to_vec()));
    assert!(file.exists());

    db.put(&w(), "m2", "newer")?;
    assert_eq!(db.get(&r(), "m2")?, Some(b"newer".to_vec()));
    Ok(())
}

#[test]
fn test_ingest_rejects_overlapping_files() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;

    let mut paths = Vec::new();
    for (name, keys) in [("one.sst", ["a", "m"]), ("two.sst", ["k", "z"])] {
        let path = dir.child(name);
        let mut writer = SstFileWriter::create(&ColumnFamilyOptions::default(), &path)?;
        for key in keys {
            writer.put(key, "v")?;
        }
        writer.finish()?;
        paths.push(path);
    }

    let err = db.ingest_external_file(&IngestOptions::default(), &paths).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(db.get(&r(), "a")?, None);
    assert_eq!(db.int_property("cinderdb.num-files-at-level0")?, Some(0));
    Ok(())
}

#[test]
fn test_properties() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "a", "1")?;
    db.put(&w(), "b", "2")?;
    db.put(&w(), "c", "3")?;

    assert_eq!(db.int_property("cinderdb.estimate-num-keys")?, Some(3));
    assert_eq!(db.int_property("cinderdb.num-immutable-mem-table")?, Some(0));
    assert_eq!(db.int_property("cinderdb.background-errors")?, Some(0));
    assert!(db.int_property("cinderdb.cur-size-active-mem-table")?.unwrap_or(0) > 0);
    assert_eq!(db.property("cinderdb.no-such-property")?, None);
    assert_eq!(db.property("other.stats")?, None);

    flush(&db)?;
    assert_eq!(db.property("cinderdb.num-files-at-level0")?, Some("1".to_string()));
    assert!(db.int_property("cinderdb.total-sst-files-size")?.unwrap_or(0) > 0);
    let stats = db.property("cinderdb.stats")?.unwrap_or_default();
    assert!(stats.contains("Level Files Size(MB)"));

    db.disable_file_deletions()?;
    assert_eq!(db.int_property("cinderdb.is-file-deletions-enabled")?, Some(0));
    db.enable_file_deletions(false)?;
    assert_eq!(db.int_property("cinderdb.is-file-deletions-enabled")?, Some(1));
    Ok(())
}

#[test]
fn test_live_files_and_wal_listing() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "k", "v")?;

    let (files, manifest_size) = db.get_live_files(true)?;
    assert!(manifest_size > 0);
    assert!(files.iter().any(|f| f == "CURRENT"));
    assert!(files.iter().any(|f| f.starts_with("MANIFEST-")));
    assert!(files.iter().any(|f| f.starts_with("OPTIONS-")));
    let tables: Vec<&String> = files.iter().filter(|f| f.ends_with(".sst")).collect();
    assert_eq!(tables.len(), 1);
    for name in &files {
        assert!(dir.child("db").join(name).exists(), "{name} missing");
    }

    let meta = db.get_live_files_metadata()?;
    assert_eq!(meta.len(), 1);
    assert_eq!(meta[0].column_family_name, "default");
    assert_eq!(&meta[0].name, tables[0]);

    let wals = db.get_sorted_wal_files()?;
    assert!(!wals.is_empty());
    assert!(wals.windows(2).all(|p| p[0].number < p[1].number));
    Ok(())
}

#[test]
fn test_approximate_sizes() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    for i in 0..200 {
        db.put(&w(), format!("key{i:04}"), vec![b'x'; 100])?;
    }
    let (count, bytes) = db.get_approximate_memtable_stats(&db.default_cf(), "key0000", "key0100")?;
    assert_eq!(count, 100);
    assert!(bytes > 0);

    flush(&db)?;
    let sizes = db.get_approximate_sizes(&db.default_cf(), &[("key0000", "key9999"), ("zz", "zzz")])?;
    assert!(sizes[0] > 0);
    assert_eq!(sizes[1], 0);
    Ok(())
}

#[test]
fn test_destroy_removes_database() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.child("db");
    {
        let db = Db::open(&test_options(), &path)?;
        db.put(&w(), "k", "v")?;
        flush(&db)?;
    }
    Db::destroy(&test_options(), &path)?;
    assert!(!path.exists());
    assert!(Db::open(&Options::default(), &path).is_err());
    Ok(())
}

#[test]
fn test_verify_checksum_on_healthy_database() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "k", "v")?;
    flush(&db)?;
    db.verify_checksum()?;
    assert!(db.background_error().is_none());
    Ok(())
}

#[test]
fn test_synced_writes_survive_crash() -> Result<()> {
    let dir = TempDir::new()?;
    let sync = WriteOptions::default().sync(true);
    let db = open_test_db(&dir)?;
    let meta = db.create_column_family("meta", ColumnFamilyOptions::default())?;

    db.put(&sync, "a", "1")?;
    db.put(&sync, "b", "2")?;
    flush(&db)?;
    // the flush switched to a new log; these land after its first sync
    db.put(&sync, "c", "3")?;
    db.delete(&sync, "a")?;
    db.put_cf(&sync, &meta, "m", "x")?;
    db.put(&sync, "d", "4")?;

    copy_live_files(&dir.child("db"), &dir.child("crashed"))?;
    drop(db);

    let db = Db::open_cf(
        &test_options(),
        dir.child("crashed"),
        vec![ColumnFamilyDescriptor::new("meta", ColumnFamilyOptions::default())],
    )?;
    let meta = db.cf_handle("meta").unwrap();
    assert_eq!(db.get(&r(), "a")?, None);
    assert_eq!(db.get(&r(), "b")?, Some(b"2".to_vec()));
    assert_eq!(db.get(&r(), "c")?, Some(b"3".to_vec()));
    assert_eq!(db.get(&r(), "d")?, Some(b"4".to_vec()));
    assert_eq!(db.get_cf(&r(), &meta, "m")?, Some(b"x".to_vec()));
    Ok(())
}

#[test]
fn test_single_delete_removes_one_put() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "once", "v")?;
    db.put(&w(), "kept", "v")?;
    flush(&db)?;

    db.single_delete(&w(), "once")?;
    assert_eq!(db.get(&r(), "once")?, None);
    flush(&db)?;
    db.compact_range(&CompactRangeOptions::default(), None, None)?;

    assert_eq!(db.get(&r(), "once")?, None);
    let mut iter = db.iterator(&r())?;
    let entries = collect_forward(&mut iter)?;
    assert_eq!(keys_of(&entries), vec![b"kept".as_slice()]);
    Ok(())
}

#[test]
fn test_cancel_background_work_stops_writes_and_compactions() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "k", "v")?;
    flush(&db)?;

    db.cancel_all_background_work(true)?;
    let err = db.compact_range(&CompactRangeOptions::default(), None, None).unwrap_err();
    assert_eq!(err.subcode(), SubCode::ManualCompactionPaused);
    let err = db.put(&w(), "k2", "v").unwrap_err();
    assert_eq!(err.code(), Code::ShutdownInProgress);

    assert_eq!(db.get(&r(), "k")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn test_resume_after_failed_log_write() -> Result<()> {
    let dir = TempDir::new()?;
    let sync = WriteOptions::default().sync(true);
    let db = open_test_db(&dir)?;
    db.put(&sync, "before", "1")?;
    let last = db.latest_sequence_number();

    // a group that never made it to the log whole, as a failed append leaves it
    let wal = db.inner.current_wal()?.unwrap();
    let mark = wal.size();
    let mut lost = WriteBatch::new();
    lost.put("lost", "x");
    lost.set_sequence(last + 1);
    wal.append(lost.data())?;
    wal.abandon(mark)?;
    let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
    db.inner.set_background_error(Error::IoError(io), true);

    assert_eq!(db.put(&w(), "blocked", "1").unwrap_err().code(), Code::IoError);
    assert_eq!(db.background_error().map(|e| e.code()), Some(Code::IoError));

    db.resume()?;
    assert!(db.background_error().is_none());
    let fresh = db.inner.current_wal()?.unwrap();
    assert!(fresh.number() > wal.number());
    assert!(!fresh.is_failed());

    db.put(&sync, "after", "2")?;
    assert_eq!(db.latest_sequence_number(), last + 1);
    assert_eq!(db.get(&r(), "lost")?, None);

    copy_live_files(&dir.child("db"), &dir.child("crashed"))?;
    drop(db);
    let db = Db::open(&test_options(), dir.child("crashed"))?;
    assert_eq!(db.get(&r(), "before")?, Some(b"1".to_vec()));
    assert_eq!(db.get(&r(), "after")?, Some(b"2".to_vec()));
    assert_eq!(db.get(&r(), "lost")?, None);
    assert_eq!(db.get(&r(), "blocked")?, None);
    assert_eq!(db.latest_sequence_number(), last + 1);
    Ok(())
}

#[test]
fn test_trace_records_writes_and_reads() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    db.put(&w(), "untraced", "0")?;

    let trace_path = dir.child("ops.trace");
    db.start_trace(TraceOptions::default(), Box::new(FileTraceWriter::create(&trace_path)?))?;
    let err = db
        .start_trace(TraceOptions::default(), Box::new(FileTraceWriter::create(dir.child("other.trace"))?))
        .unwrap_err();
    assert_eq!(err.code(), Code::Busy);

    db.put(&w(), "k", "v")?;
    assert_eq!(db.get(&r(), "k")?, Some(b"v".to_vec()));
    db.end_trace()?;
    assert!(db.end_trace().is_err());
    db.put(&w(), "after", "1")?;

    let mut reader = TraceReader::open(&trace_path)?;
    let mut kinds = Vec::new();
    while let Some(record) = reader.next_record()? {
        match record.kind {
            TraceType::Write => {
                let batch = record.batch()?;
                assert_eq!(batch.count(), 1);
            }
            TraceType::Get => {
                assert_eq!(record.key()?, (0, b"k".as_slice()));
            }
            _ => {}
        }
        kinds.push(record.kind);
    }
    assert_eq!(kinds, vec![TraceType::Write, TraceType::Get, TraceType::End]);
    Ok(())
}

#[test]
fn test_tiered_compaction_fills_deeper_levels() -> Result<()> {
    let dir = TempDir::new()?;
    let cf_options = ColumnFamilyOptions::default()
        .disable_auto_compactions(true)
        .num_levels(4)
        .level0_file_num_compaction_trigger(2)
        .target_file_size_base(8 * 1024)
        .compaction_style(CompactionStyle::Tiered)
        .compaction(
            CompactionConfig::default()
                .max_tables_per_level(2)
                .size_ratio_threshold(2),
        );
    let db = Db::open(&Options::default().create_if_missing(true).cf_options(cf_options), dir.child("db"))?;
    let cfd = db.resolve(&db.default_cf())?;
    let value = vec![b'v'; 200];

    let mut deepest = 0;
    for round in 0..4 {
        for i in 0..200 {
            db.put(&w(), format!("key{:02}{:04}", round, i), &value)?;
        }
        flush(&db)?;

        let _guard = db.inner.compaction_lock.lock()?;
        while let Some(compaction) = pick_compaction(&cfd.current()?, |_| None) {
            db.inner.run_compaction(&cfd, compaction)?;
        }
        deepest = deepest.max(cfd.current()?.max_level_with_files().unwrap_or(0));
    }

    assert!(deepest >= 2, "data never left level {}", deepest);
    assert_eq!(cfd.current()?.num_files(0), 0);
    for round in 0..4 {
        for i in (0..200).step_by(37) {
            assert_eq!(db.get(&r(), format!("key{:02}{:04}", round, i))?, Some(value.clone()));
        }
    }
    Ok(())
}

#[test]
fn test_iterator_with_readahead_sees_same_entries() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_test_db(&dir)?;
    for i in 0..500 {
        db.put(&w(), format!("key{:04}", i), format!("value{}", i))?;
    }
    flush(&db)?;

    let mut plain = db.iterator(&r())?;
    let expected = collect_forward(&mut plain)?;
    let mut ahead = db.iterator(&r().readahead_size(256 * 1024))?;
    assert_eq!(collect_forward(&mut ahead)?, expected);
    assert_eq!(expected.len(), 500);
    Ok(())
}
