use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::CompactionStyle;
use crate::types::{compare_keys, InternalKey};
use crate::version::Version;

use super::{key_range, Compaction, CompactionInputs, CompactionReason};

/// Picks the most urgent compaction for `version`, if any. `cursor`
/// returns the largest key compacted last time at a level.
pub(crate) fn pick_compaction(
    version: &Arc<Version>,
    cursor: impl Fn(usize) -> Option<InternalKey>,
) -> Option<Compaction> {
    match version.options().compaction_style {
        CompactionStyle::Level => pick_leveled(version, cursor),
        CompactionStyle::Tiered => pick_tiered(version),
    }
}

/// Level 0 scores by file count against the trigger, deeper levels by
/// size against their target. The last level has no target.
pub(crate) fn level_scores(version: &Version) -> Vec<(usize, f64)> {
    let options = version.options();
    let num_levels = version.num_levels();
    let mut scores = Vec::with_capacity(num_levels);
    if num_levels < 2 {
        return scores;
    }
    scores.push((
        0,
        version.num_files(0) as f64 / options.level0_file_num_compaction_trigger.max(1) as f64,
    ));
    for level in 1..num_levels - 1 {
        let target = options.max_bytes_for_level(level).max(1);
        scores.push((level, version.level_bytes(level) as f64 / target as f64));
    }
    scores
}

fn pick_leveled(version: &Arc<Version>, cursor: impl Fn(usize) -> Option<InternalKey>) -> Option<Compaction> {
    let (level, score) = level_scores(version)
        .into_iter()
        .filter(|(_, score)| *score >= 1.0)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))?;
    let cmp = version.comparator();
    let target_file_size = version.options().target_file_size_base;

    let (start, reason) = if level == 0 {
        (version.files(0).to_vec(), CompactionReason::LevelL0FilesNum)
    } else {
        // Round-robin: the first file past the previous compaction's end.
        let files = version.files(level);
        let picked = cursor(level)
            .and_then(|last| {
                files
                    .iter()
                    .find(|f| compare_keys(cmp, &f.largest, &last) == Ordering::Greater)
            })
            .or_else(|| files.first())?;
        (vec![Arc::clone(picked)], CompactionReason::LevelMaxBytes)
    };

    let (smallest, largest) = key_range(cmp, start.iter())?;
    let next = version.overlapping_files(level + 1, Some(&smallest), Some(&largest));
    tracing::debug!(
        cf = version.cf_id(),
        level,
        score,
        inputs = start.len(),
        overlapping = next.len(),
        "Picked leveled compaction"
    );
    Some(Compaction::new(
        Arc::clone(version),
        vec![
            CompactionInputs { level, files: start },
            CompactionInputs {
                level: level + 1,
                files: next,
            },
        ],
        level + 1,
        target_file_size,
        reason,
    ))
}

/// Level whose tables should be merged into the next one.
///
/// Level 0 goes first once it reaches the trigger. A deeper level needs at
/// least `max_tables_per_level` tables and must either be the last level
/// or outweigh the next level by `size_ratio_threshold`.
pub(crate) fn find_tiered_level(version: &Version) -> Option<usize> {
    let options = version.options();
    let config = &options.compaction;
    let num_levels = version.num_levels();

    if version.num_files(0) >= options.level0_file_num_compaction_trigger.max(1) {
        return Some(0);
    }

    // In-place merges of a single table would never settle.
    let min_tables = config.max_tables_per_level.max(2);
    for level in 1..num_levels {
        if version.num_files(level) < min_tables {
            continue;
        }
        if level == num_levels - 1 {
            return Some(level);
        }
        let current = version.level_bytes(level);
        let next = version.level_bytes(level + 1).max(1);
        if current / next >= config.size_ratio_threshold as u64 {
            return Some(level);
        }
    }
    None
}

fn pick_tiered(version: &Arc<Version>) -> Option<Compaction> {
    let level = find_tiered_level(version)?;
    let last = version.num_levels() - 1;
    let output_level = (level + 1).min(last);

    let mut inputs = vec![CompactionInputs {
        level,
        files: version.files(level).to_vec(),
    }];
    if output_level != level {
        inputs.push(CompactionInputs {
            level: output_level,
            files: version.files(output_level).to_vec(),
        });
    }
    // Outputs moving down are split so the next level gathers tables.
    // Merging the last level into itself yields a single table.
    let max_output_file_size = if output_level == level {
        u64::MAX
    } else {
        version.options().target_file_size_base
    };
    tracing::debug!(cf = version.cf_id(), level, output_level, "Picked tiered compaction");
    Some(Compaction::new(
        Arc::clone(version),
        inputs,
        output_level,
        max_output_file_size,
        CompactionReason::Tiered,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnFamilyOptions, CompactionConfig};
    use crate::manifest::FileMetaData;
    use crate::types::ValueType;

    fn file(number: u64, smallest: &str, largest: &str, size: u64) -> Arc<FileMetaData> {
        Arc::new(FileMetaData {
            number,
            file_size: size,
            smallest: InternalKey::new(smallest.as_bytes().to_vec(), number * 10, ValueType::Put),
            largest: InternalKey::new(largest.as_bytes().to_vec(), number * 10, ValueType::Put),
            smallest_seq: number * 10,
            largest_seq: number * 10,
            num_entries: 1,
            num_deletions: 0,
            num_range_deletions: 0,
            global_seqno: None,
        })
    }

    fn version(options: ColumnFamilyOptions, levels: Vec<Vec<Arc<FileMetaData>>>) -> Arc<Version> {
        Arc::new(Version::from_levels(0, 1, Arc::new(options), levels).unwrap())
    }

    #[test]
    fn test_level0_trigger_pulls_overlapping_level1() {
        let options = ColumnFamilyOptions::default()
            .num_levels(4)
            .level0_file_num_compaction_trigger(2);
        let v = version(
            options,
            vec![
                vec![file(5, "c", "f", 100), file(6, "a", "d", 100)],
                vec![file(1, "a", "b", 100), file(2, "e", "g", 100), file(3, "x", "z", 100)],
            ],
        );
        let c = pick_compaction(&v, |_| None).unwrap();
        assert_eq!(c.reason, CompactionReason::LevelL0FilesNum);
        assert_eq!(c.output_level, 1);
        let mut numbers: Vec<u64> = c.input_files().map(|(_, f)| f.number).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![1, 2, 5, 6]);
        assert!(c.bottommost);
        assert!(!c.is_trivial_move());
    }

    #[test]
    fn test_oversized_level_round_robin() {
        let options = ColumnFamilyOptions::default()
            .num_levels(4)
            .max_bytes_for_level_base(150);
        let v = version(
            options,
            vec![
                vec![],
                vec![file(1, "a", "c", 100), file(2, "d", "f", 100)],
                vec![file(3, "e", "e", 100)],
            ],
        );

        let first = pick_compaction(&v, |_| None).unwrap();
        assert_eq!(first.reason, CompactionReason::LevelMaxBytes);
        assert_eq!(first.num_input_files(), 1);
        assert!(first.is_trivial_move());

        let after_first = InternalKey::new(b"c".to_vec(), 10, ValueType::Put);
        let second = pick_compaction(&v, |_| Some(after_first.clone())).unwrap();
        let numbers: Vec<u64> = second.input_files().map(|(_, f)| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);
        assert!(!second.is_trivial_move());
    }

    #[test]
    fn test_no_compaction_under_thresholds() {
        let v = version(
            ColumnFamilyOptions::default().num_levels(3),
            vec![vec![file(1, "a", "b", 10)], vec![file(2, "a", "z", 10)]],
        );
        assert!(pick_compaction(&v, |_| None).is_none());
    }

    #[test]
    fn test_tiered_merges_whole_levels() {
        let options = ColumnFamilyOptions::default()
            .num_levels(3)
            .target_file_size_base(1024)
            .compaction_style(CompactionStyle::Tiered)
            .compaction(
                CompactionConfig::default()
                    .max_tables_per_level(2)
                    .size_ratio_threshold(2),
            );
        let v = version(
            options.clone(),
            vec![
                vec![],
                vec![file(1, "a", "c", 400), file(2, "d", "f", 400)],
                vec![file(3, "a", "z", 100)],
            ],
        );
        assert_eq!(find_tiered_level(&v), Some(1));
        let c = pick_compaction(&v, |_| None).unwrap();
        assert_eq!(c.output_level, 2);
        assert_eq!(c.num_input_files(), 3);
        assert_eq!(c.max_output_file_size, 1024);

        let last_level = version(
            options,
            vec![vec![], vec![], vec![file(4, "a", "c", 10), file(5, "d", "f", 10)]],
        );
        let c = pick_compaction(&last_level, |_| None).unwrap();
        assert_eq!(c.start_level(), 2);
        assert_eq!(c.output_level, 2);
        assert_eq!(c.max_output_file_size, u64::MAX);
    }
}
