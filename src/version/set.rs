//! The set of live versions and the manifest that persists them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use super::{Version, VersionBuilder};
use crate::config::ColumnFamilyOptions;
use crate::error::Result;
use crate::filename::{manifest_file_name, read_current_file, set_current_file, sync_dir};
use crate::manifest::{FileMetaData, ManifestReader, ManifestWriter, VersionEdit};
use crate::types::SequenceNumber;
use crate::Error;

pub const DEFAULT_COLUMN_FAMILY_ID: u32 = 0;
pub const DEFAULT_COLUMN_FAMILY_NAME: &str = "default";

pub struct ColumnFamilyState {
    pub id: u32,
    pub name: String,
    pub options: Arc<ColumnFamilyOptions>,
    pub current: Arc<Version>,
    /// Logs below this number hold nothing unflushed for the family.
    pub log_number: u64,
}

pub struct VersionSet {
    dir: PathBuf,
    max_manifest_file_size: u64,
    manifest: Option<ManifestWriter>,
    manifest_number: u64,
    next_file_number: u64,
    last_sequence: SequenceNumber,
    max_column_family: u32,
    column_families: BTreeMap<u32, ColumnFamilyState>,
    live: Vec<Weak<Version>>,
    next_version_number: u64,
}

impl std::fmt::Debug for VersionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("dir", &self.dir)
            .field("manifest_number", &self.manifest_number)
            .field("next_file_number", &self.next_file_number)
            .field("last_sequence", &self.last_sequence)
            .field("column_families", &self.column_families.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Column family contents as replayed from a manifest.
#[derive(Default)]
struct ReplayedFamily {
    name: String,
    comparator: Option<String>,
    log_number: u64,
    levels: Vec<BTreeMap<u64, FileMetaData>>,
}

struct Replayed {
    manifest_number: u64,
    next_file_number: u64,
    last_sequence: SequenceNumber,
    max_column_family: u32,
    families: BTreeMap<u32, ReplayedFamily>,
}

fn replay(dir: &Path) -> Result<Replayed> {
    let manifest_number = read_current_file(dir)?;
    let mut reader = ManifestReader::open(&manifest_file_name(dir, manifest_number))?;

    let mut replayed = Replayed {
        manifest_number,
        next_file_number: manifest_number + 1,
        last_sequence: 0,
        max_column_family: 0,
        families: BTreeMap::new(),
    };
    replayed.families.insert(
        DEFAULT_COLUMN_FAMILY_ID,
        ReplayedFamily {
            name: DEFAULT_COLUMN_FAMILY_NAME.to_string(),
            ..Default::default()
        },
    );

    fn family(families: &mut BTreeMap<u32, ReplayedFamily>, cf: u32) -> Result<&mut ReplayedFamily> {
        families
            .get_mut(&cf)
            .ok_or_else(|| Error::Corruption(format!("manifest edit for unknown column family {}", cf)))
    }

    let mut groups = 0usize;
    while let Some(group) = reader.next_group()? {
        groups += 1;
        for edit in group {
            match edit {
                VersionEdit::AddColumnFamily { cf, name } => {
                    replayed.families.entry(cf).or_default().name = name;
                    replayed.max_column_family = replayed.max_column_family.max(cf);
                }
                VersionEdit::DropColumnFamily { cf } => {
                    replayed.families.remove(&cf);
                }
                VersionEdit::Comparator { cf, name } => {
                    family(&mut replayed.families, cf)?.comparator = Some(name);
                }
                VersionEdit::AddFile { cf, level, meta } => {
                    let fam = family(&mut replayed.families, cf)?;
                    let level = level as usize;
                    if fam.levels.len() <= level {
                        fam.levels.resize_with(level + 1, BTreeMap::new);
                    }
                    fam.levels[level].insert(meta.number, meta);
                }
                VersionEdit::DeleteFile { cf, level, number } => {
                    let fam = family(&mut replayed.families, cf)?;
                    if let Some(files) = fam.levels.get_mut(level as usize) {
                        files.remove(&number);
                    }
                }
                VersionEdit::LogNumber { cf, number } => {
                    family(&mut replayed.families, cf)?.log_number = number;
                }
                VersionEdit::NextFileNumber(n) => {
                    replayed.next_file_number = replayed.next_file_number.max(n);
                }
                VersionEdit::LastSequence(seq) => replayed.last_sequence = seq,
                VersionEdit::MaxColumnFamily(cf) => {
                    replayed.max_column_family = replayed.max_column_family.max(cf);
                }
            }
        }
    }
    tracing::debug!(manifest_number, groups, "Replayed manifest");
    Ok(replayed)
}

impl VersionSet {
    /// State of a brand new database holding only the default family. No
    /// manifest exists until [`VersionSet::write_snapshot`].
    pub fn new_database(
        dir: impl Into<PathBuf>,
        max_manifest_file_size: u64,
        default_options: Arc<ColumnFamilyOptions>,
    ) -> Self {
        let mut set = Self::empty(dir.into(), max_manifest_file_size);
        let version = set.register(Version::empty(DEFAULT_COLUMN_FAMILY_ID, Arc::clone(&default_options)));
        set.column_families.insert(
            DEFAULT_COLUMN_FAMILY_ID,
            ColumnFamilyState {
                id: DEFAULT_COLUMN_FAMILY_ID,
                name: DEFAULT_COLUMN_FAMILY_NAME.to_string(),
                options: default_options,
                current: version,
                log_number: 0,
            },
        );
        set
    }

    fn empty(dir: PathBuf, max_manifest_file_size: u64) -> Self {
        Self {
            dir,
            max_manifest_file_size,
            manifest: None,
            manifest_number: 0,
            next_file_number: 1,
            last_sequence: 0,
            max_column_family: 0,
            column_families: BTreeMap::new(),
            live: Vec::new(),
            next_version_number: 1,
        }
    }

    /// Rebuilds every column family from `CURRENT` and its manifest.
    ///
    /// `families` maps names to options. With `require_all`, a family present
    /// in the manifest but missing from `families` is an error; otherwise it
    /// is left closed.
    pub fn recover(
        dir: impl Into<PathBuf>,
        max_manifest_file_size: u64,
        families: &HashMap<String, Arc<ColumnFamilyOptions>>,
        require_all: bool,
    ) -> Result<Self> {
        let dir = dir.into();
        let replayed = replay(&dir)?;
        let mut set = Self::empty(dir, max_manifest_file_size);
        set.manifest_number = replayed.manifest_number;
        set.next_file_number = replayed.next_file_number;
        set.last_sequence = replayed.last_sequence;
        set.max_column_family = replayed.max_column_family;

        let mut missing = Vec::new();
        for (id, fam) in replayed.families {
            let Some(options) = families.get(&fam.name) else {
                missing.push(fam.name);
                continue;
            };
            if let Some(recorded) = &fam.comparator {
                if recorded != options.comparator.name() {
                    return Err(Error::InvalidArgument(format!(
                        "column family {} was created with comparator {}, opened with {}",
                        fam.name,
                        recorded,
                        options.comparator.name()
                    )));
                }
            }
            let levels = fam
                .levels
                .into_iter()
                .map(|files| files.into_values().map(Arc::new).collect())
                .collect();
            let number = set.next_version_number;
            set.next_version_number += 1;
            let version = set.register(Version::from_levels(id, number, Arc::clone(options), levels)?);
            set.column_families.insert(
                id,
                ColumnFamilyState {
                    id,
                    name: fam.name,
                    options: Arc::clone(options),
                    current: version,
                    log_number: fam.log_number,
                },
            );
        }

        if require_all && !missing.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "column families not opened: {}",
                missing.join(", ")
            )));
        }
        Ok(set)
    }

    /// Names of every live column family, in id order.
    pub fn list_column_families(dir: &Path) -> Result<Vec<String>> {
        Ok(replay(dir)?.families.into_values().map(|f| f.name).collect())
    }

    fn register(&mut self, version: Version) -> Arc<Version> {
        let version = Arc::new(version);
        self.live.push(Arc::downgrade(&version));
        version
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_number(&self) -> u64 {
        self.manifest_number
    }

    /// Durable size of the current manifest.
    pub fn manifest_size(&self) -> u64 {
        self.manifest.as_ref().map_or(0, |m| m.size())
    }

    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    pub fn next_file_number(&self) -> u64 {
        self.next_file_number
    }

    /// Makes sure `number` is never handed out again.
    pub fn mark_file_number_used(&mut self, number: u64) {
        self.next_file_number = self.next_file_number.max(number + 1);
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub fn max_column_family(&self) -> u32 {
        self.max_column_family
    }

    pub fn column_family(&self, id: u32) -> Option<&ColumnFamilyState> {
        self.column_families.get(&id)
    }

    pub fn column_family_by_name(&self, name: &str) -> Option<&ColumnFamilyState> {
        self.column_families.values().find(|cf| cf.name == name)
    }

    pub fn column_families(&self) -> impl Iterator<Item = &ColumnFamilyState> {
        self.column_families.values()
    }

    pub fn current(&self, id: u32) -> Option<Arc<Version>> {
        self.column_families.get(&id).map(|cf| Arc::clone(&cf.current))
    }

    /// Smallest log number any column family still needs on recovery.
    pub fn min_log_number(&self) -> u64 {
        self.column_families
            .values()
            .map(|cf| cf.log_number)
            .min()
            .unwrap_or(0)
    }

    fn snapshot_edits(&self) -> Vec<VersionEdit> {
        let mut edits = Vec::new();
        for cf in self.column_families.values() {
            edits.push(VersionEdit::AddColumnFamily {
                cf: cf.id,
                name: cf.name.clone(),
            });
            edits.push(VersionEdit::Comparator {
                cf: cf.id,
                name: cf.options.comparator.name().to_string(),
            });
            edits.push(VersionEdit::LogNumber {
                cf: cf.id,
                number: cf.log_number,
            });
            for (level, file) in cf.current.all_files() {
                edits.push(VersionEdit::AddFile {
                    cf: cf.id,
                    level: level as u32,
                    meta: (**file).clone(),
                });
            }
        }
        edits.push(VersionEdit::NextFileNumber(self.next_file_number));
        edits.push(VersionEdit::LastSequence(self.last_sequence));
        edits.push(VersionEdit::MaxColumnFamily(self.max_column_family));
        edits
    }

    /// Starts a new manifest holding the full current state and points
    /// `CURRENT` at it. The previous manifest becomes obsolete.
    pub fn write_snapshot(&mut self) -> Result<()> {
        let number = self.new_file_number();
        let path = manifest_file_name(&self.dir, number);
        let mut writer = ManifestWriter::create(&path, number)?;
        let result = writer
            .append(&self.snapshot_edits())
            .and_then(|_| set_current_file(&self.dir, number))
            .and_then(|_| sync_dir(&self.dir));
        if let Err(e) = result {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        tracing::info!(
            manifest_number = number,
            size = writer.size(),
            "Wrote manifest snapshot"
        );
        self.manifest = Some(writer);
        self.manifest_number = number;
        Ok(())
    }

    fn write_group(&mut self, mut edits: Vec<VersionEdit>, last_sequence: SequenceNumber) -> Result<()> {
        let manifest = self
            .manifest
            .as_mut()
            .ok_or_else(|| Error::NotSupported("database is not writable".into()))?;
        self.last_sequence = self.last_sequence.max(last_sequence);
        edits.push(VersionEdit::NextFileNumber(self.next_file_number));
        edits.push(VersionEdit::LastSequence(self.last_sequence));
        manifest.append(&edits)
    }

    fn maybe_roll_manifest(&mut self) {
        if self.manifest_size() <= self.max_manifest_file_size {
            return;
        }
        // the old manifest already holds everything, so a failed rewrite only
        // postpones the roll
        if let Err(e) = self.write_snapshot() {
            tracing::warn!(error = %e, "Failed to rewrite manifest");
        }
    }

    /// Persists a group of file and log edits and installs the resulting
    /// versions. Edits for dropped column families are discarded.
    pub fn log_and_apply(&mut self, edits: Vec<VersionEdit>, last_sequence: SequenceNumber) -> Result<()> {
        let edits: Vec<VersionEdit> = edits
            .into_iter()
            .filter(|edit| match edit {
                VersionEdit::AddFile { cf, .. }
                | VersionEdit::DeleteFile { cf, .. }
                | VersionEdit::LogNumber { cf, .. } => self.column_families.contains_key(cf),
                _ => true,
            })
            .collect();

        let mut builders: BTreeMap<u32, VersionBuilder> = BTreeMap::new();
        let mut log_numbers: HashMap<u32, u64> = HashMap::new();
        for edit in &edits {
            match edit {
                VersionEdit::AddFile { cf, .. } | VersionEdit::DeleteFile { cf, .. } => {
                    let builder = match builders.entry(*cf) {
                        std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
                        std::collections::btree_map::Entry::Vacant(e) => {
                            let base = Arc::clone(&self.column_families[cf].current);
                            e.insert(VersionBuilder::new(base))
                        }
                    };
                    builder.apply(edit)?;
                }
                VersionEdit::LogNumber { cf, number } => {
                    log_numbers.insert(*cf, *number);
                }
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "unexpected edit in log_and_apply: {:?}",
                        other
                    )))
                }
            }
        }

        let mut built = Vec::with_capacity(builders.len());
        for (cf, builder) in builders {
            let number = self.next_version_number;
            self.next_version_number += 1;
            built.push((cf, builder.build(number)?));
        }

        self.write_group(edits, last_sequence)?;

        for (cf, version) in built {
            let version = self.register(version);
            if let Some(state) = self.column_families.get_mut(&cf) {
                state.current = version;
            }
        }
        for (cf, number) in log_numbers {
            if let Some(state) = self.column_families.get_mut(&cf) {
                state.log_number = state.log_number.max(number);
            }
        }
        self.maybe_roll_manifest();
        Ok(())
    }

    pub fn create_column_family(
        &mut self,
        name: &str,
        options: Arc<ColumnFamilyOptions>,
        log_number: u64,
        last_sequence: SequenceNumber,
    ) -> Result<u32> {
        if self.column_family_by_name(name).is_some() {
            return Err(Error::InvalidArgument(format!(
                "column family {} already exists",
                name
            )));
        }
        let id = self.max_column_family + 1;
        let edits = vec![
            VersionEdit::AddColumnFamily {
                cf: id,
                name: name.to_string(),
            },
            VersionEdit::Comparator {
                cf: id,
                name: options.comparator.name().to_string(),
            },
            VersionEdit::LogNumber {
                cf: id,
                number: log_number,
            },
            VersionEdit::MaxColumnFamily(id),
        ];
        self.write_group(edits, last_sequence)?;

        self.max_column_family = id;
        let version = self.register(Version::empty(id, Arc::clone(&options)));
        self.column_families.insert(
            id,
            ColumnFamilyState {
                id,
                name: name.to_string(),
                options,
                current: version,
                log_number,
            },
        );
        self.maybe_roll_manifest();
        Ok(id)
    }

    pub fn drop_column_family(&mut self, id: u32, last_sequence: SequenceNumber) -> Result<()> {
        if id == DEFAULT_COLUMN_FAMILY_ID {
            return Err(Error::InvalidArgument(
                "the default column family cannot be dropped".into(),
            ));
        }
        if !self.column_families.contains_key(&id) {
            return Err(Error::InvalidArgument(format!(
                "column family {} does not exist",
                id
            )));
        }
        self.write_group(vec![VersionEdit::DropColumnFamily { cf: id }], last_sequence)?;
        self.column_families.remove(&id);
        self.maybe_roll_manifest();
        Ok(())
    }

    /// File numbers referenced by any version still alive.
    pub fn live_files(&mut self) -> HashSet<u64> {
        let mut live = HashSet::new();
        self.live.retain(|weak| match weak.upgrade() {
            Some(version) => {
                live.extend(version.all_files().map(|(_, f)| f.number));
                true
            }
            None => false,
        });
        for cf in self.column_families.values() {
            live.extend(cf.current.all_files().map(|(_, f)| f.number));
        }
        live
    }

    pub fn num_live_versions(&mut self) -> usize {
        self.live.retain(|weak| weak.strong_count() > 0);
        self.live.len()
    }
}
