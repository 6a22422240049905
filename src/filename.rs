//! Names of the files that make up a database directory.
//!
//! ```text
//! 000007.log        write-ahead log
//! 000012.sst        table file
//! MANIFEST-000003   version edit log
//! CURRENT           name of the live manifest
//! OPTIONS-000004    options used by the last open
//! LOCK              process lock
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub const CURRENT: &str = "CURRENT";
pub const LOCK: &str = "LOCK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Log(u64),
    Table(u64),
    Manifest(u64),
    Options(u64),
    Current,
    Lock,
    Temp(u64),
}

pub fn log_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.log", number))
}

pub fn table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", number))
}

pub fn manifest_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{:06}", number))
}

pub fn options_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("OPTIONS-{:06}", number))
}

pub fn temp_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.dbtmp", number))
}

pub fn current_file_name(dir: &Path) -> PathBuf {
    dir.join(CURRENT)
}

pub fn lock_file_name(dir: &Path) -> PathBuf {
    dir.join(LOCK)
}

pub fn parse_file_name(name: &str) -> Option<FileType> {
    match name {
        CURRENT => return Some(FileType::Current),
        LOCK => return Some(FileType::Lock),
        _ => {}
    }
    if let Some(num) = name.strip_prefix("MANIFEST-") {
        return num.parse().ok().map(FileType::Manifest);
    }
    if let Some(num) = name.strip_prefix("OPTIONS-") {
        return num.parse().ok().map(FileType::Options);
    }
    let (stem, ext) = name.split_once('.')?;
    let number: u64 = stem.parse().ok()?;
    match ext {
        "log" => Some(FileType::Log(number)),
        "sst" => Some(FileType::Table(number)),
        "dbtmp" => Some(FileType::Temp(number)),
        _ => None,
    }
}

/// Points CURRENT at `MANIFEST-<number>` through a temp file and rename.
pub fn set_current_file(dir: &Path, manifest_number: u64) -> Result<()> {
    let contents = format!("MANIFEST-{:06}\n", manifest_number);
    let tmp = temp_file_name(dir, manifest_number);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, current_file_name(dir)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    sync_dir(dir)
}

/// Reads CURRENT and returns the manifest number it names.
pub fn read_current_file(dir: &Path) -> Result<u64> {
    let contents = fs::read_to_string(current_file_name(dir))?;
    let name = contents.trim_end_matches('\n');
    match parse_file_name(name) {
        Some(FileType::Manifest(number)) if contents.ends_with('\n') => Ok(number),
        _ => Err(crate::Error::Corruption(format!(
            "CURRENT file does not name a manifest: {:?}",
            contents
        ))),
    }
}

#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_parse_round_trips_generated_names() {
        let dir = Path::new("/db");
        let cases = [
            (log_file_name(dir, 7), FileType::Log(7)),
            (table_file_name(dir, 123456), FileType::Table(123456)),
            (manifest_file_name(dir, 3), FileType::Manifest(3)),
            (options_file_name(dir, 4), FileType::Options(4)),
            (temp_file_name(dir, 9), FileType::Temp(9)),
        ];
        for (path, expected) in cases {
            let name = path.file_name().unwrap().to_str().unwrap();
            assert_eq!(parse_file_name(name), Some(expected), "{}", name);
        }
        assert_eq!(parse_file_name("CURRENT"), Some(FileType::Current));
        assert_eq!(parse_file_name("LOCK"), Some(FileType::Lock));
        assert_eq!(parse_file_name("notes.txt"), None);
        assert_eq!(parse_file_name("MANIFEST-abc"), None);
    }

    #[test]
    fn test_current_file() -> Result<()> {
        let dir = TempDir::new()?;
        set_current_file(dir.path(), 5)?;
        assert_eq!(read_current_file(dir.path())?, 5);

        fs::write(current_file_name(dir.path()), "garbage")?;
        assert!(read_current_file(dir.path()).unwrap_err().is_corruption());
        Ok(())
    }
}
