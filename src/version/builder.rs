use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use super::Version;
use crate::error::Result;
use crate::manifest::{FileMetaData, VersionEdit};
use crate::Error;

/// Accumulates file edits on top of a base version.
pub struct VersionBuilder {
    base: Arc<Version>,
    deleted: Vec<HashSet<u64>>,
    added: Vec<BTreeMap<u64, Arc<FileMetaData>>>,
}

impl VersionBuilder {
    pub fn new(base: Arc<Version>) -> Self {
        let levels = base.num_levels();
        Self {
            base,
            deleted: vec![HashSet::new(); levels],
            added: vec![BTreeMap::new(); levels],
        }
    }

    fn check_level(&self, level: u32) -> Result<usize> {
        let level = level as usize;
        if level >= self.added.len() {
            return Err(Error::Corruption(format!(
                "level {} out of range for column family {}",
                level,
                self.base.cf_id()
            )));
        }
        Ok(level)
    }

    /// Applies file edits addressed to this builder's column family; other
    /// edits are ignored.
    pub fn apply(&mut self, edit: &VersionEdit) -> Result<()> {
        match edit {
            VersionEdit::AddFile { cf, level, meta } if *cf == self.base.cf_id() => {
                let level = self.check_level(*level)?;
                self.deleted[level].remove(&meta.number);
                self.added[level].insert(meta.number, Arc::new(meta.clone()));
            }
            VersionEdit::DeleteFile { cf, level, number } if *cf == self.base.cf_id() => {
                let level = self.check_level(*level)?;
                if self.added[level].remove(number).is_none() {
                    self.deleted[level].insert(*number);
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn build(self, number: u64) -> Result<Version> {
        let mut levels = Vec::with_capacity(self.added.len());
        for (level, added) in self.added.into_iter().enumerate() {
            let mut files: Vec<Arc<FileMetaData>> = self
                .base
                .files(level)
                .iter()
                .filter(|f| !self.deleted[level].contains(&f.number) && !added.contains_key(&f.number))
                .cloned()
                .collect();
            files.extend(added.into_values());
            levels.push(files);
        }
        Version::from_levels(self.base.cf_id(), number, Arc::clone(self.base.options()), levels)
    }
}
