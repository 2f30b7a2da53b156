//! Layout: shard directories and record filenames
//!
//! ```text
//! <base>/
//!   0/            shard directories, numeric names
//!     0           record, no flags
//!     1_h         record, HELD
//!     2_bh        record, BROKEN and HELD
//!     3.tmp       write in progress, invisible
//!   1/
//!     0
//! ```
//!
//! Shards and records are always enumerated in numeric order, so that
//! `9` sorts before `10` whatever the filename width.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Suffix of files whose write has not been committed by a rename.
pub const TMP_SUFFIX: &str = ".tmp";

const HELD_CHAR: char = 'h';
const BROKEN_CHAR: char = 'b';

// ── Flags ───────────────────────────────────────────────────────────

/// Lifecycle flags encoded in a record's filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RecordFlags {
    /// Type not currently accepted by the peer.
    pub held: bool,
    /// Record could not be decoded.
    pub broken: bool,
}

impl RecordFlags {
    pub const NONE: RecordFlags = RecordFlags {
        held: false,
        broken: false,
    };
    pub const HELD: RecordFlags = RecordFlags {
        held: true,
        broken: false,
    };
    pub const BROKEN: RecordFlags = RecordFlags {
        held: false,
        broken: true,
    };

    /// True for records that take part in delivery and offset counting.
    pub fn is_unflagged(&self) -> bool {
        !self.held && !self.broken
    }

    pub fn with_held(self, held: bool) -> Self {
        Self { held, ..self }
    }

    pub fn with_broken(self, broken: bool) -> Self {
        Self { broken, ..self }
    }

    /// Filename suffix characters in sorted order ("", "b", "h", "bh").
    pub fn suffix(&self) -> String {
        let mut s = String::new();
        if self.broken {
            s.push(BROKEN_CHAR);
        }
        if self.held {
            s.push(HELD_CHAR);
        }
        s
    }

    /// Parse a suffix. Unknown flag characters are rejected.
    pub fn parse(suffix: &str) -> Option<Self> {
        let mut flags = RecordFlags::NONE;
        for c in suffix.chars() {
            match c {
                HELD_CHAR => flags.held = true,
                BROKEN_CHAR => flags.broken = true,
                _ => return None,
            }
        }
        Some(flags)
    }
}

impl fmt::Display for RecordFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unflagged() {
            write!(f, "-")
        } else {
            write!(f, "{}", self.suffix())
        }
    }
}

// ── Record Names ────────────────────────────────────────────────────

/// A record filename: `<seq>` or `<seq>_<flags>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordName {
    pub seq: u64,
    pub flags: RecordFlags,
}

impl RecordName {
    pub fn new(seq: u64, flags: RecordFlags) -> Self {
        Self { seq, flags }
    }

    /// Parse a directory entry name. Returns `None` for temp files and
    /// anything that is not a record.
    pub fn parse(name: &str) -> Option<Self> {
        if name.ends_with(TMP_SUFFIX) {
            return None;
        }
        let (digits, flags) = match name.split_once('_') {
            Some((digits, suffix)) => (digits, RecordFlags::parse(suffix)?),
            None => (name, RecordFlags::NONE),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let seq = digits.parse::<u64>().ok()?;
        Some(Self { seq, flags })
    }

    pub fn file_name(&self) -> String {
        if self.flags.is_unflagged() {
            self.seq.to_string()
        } else {
            format!("{}_{}", self.seq, self.flags.suffix())
        }
    }

    /// Name of the temp file this record is written through.
    pub fn tmp_file_name(&self) -> String {
        format!("{}{}", self.seq, TMP_SUFFIX)
    }
}

/// Position of a record: shard number, then sequence within the shard.
/// Ordering by key is insertion (delivery) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub shard: u64,
    pub seq: u64,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.shard, self.seq)
    }
}

/// A record found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    pub key: RecordKey,
    pub flags: RecordFlags,
    pub path: PathBuf,
}

// ── Shard Layout ────────────────────────────────────────────────────

/// Filesystem operations over the shard hierarchy.
#[derive(Debug, Clone)]
pub struct ShardLayout {
    base: PathBuf,
    capacity: usize,
}

impl ShardLayout {
    pub fn new(base: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            base: base.into(),
            capacity: capacity.max(1),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn shard_path(&self, shard: u64) -> PathBuf {
        self.base.join(shard.to_string())
    }

    pub fn record_path(&self, key: RecordKey, flags: RecordFlags) -> PathBuf {
        self.shard_path(key.shard)
            .join(RecordName::new(key.seq, flags).file_name())
    }

    pub fn tmp_path(&self, key: RecordKey) -> PathBuf {
        self.shard_path(key.shard)
            .join(RecordName::new(key.seq, RecordFlags::NONE).tmp_file_name())
    }

    /// Shard numbers in numeric order.
    pub fn shards(&self) -> io::Result<Vec<u64>> {
        let mut shards = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match name.parse::<u64>() {
                Ok(n) if name.bytes().all(|b| b.is_ascii_digit()) => shards.push(n),
                _ => warn!(dir = %entry.path().display(), "Ignoring non-shard directory"),
            }
        }
        shards.sort_unstable();
        Ok(shards)
    }

    /// Records of one shard in numeric order. Temp files are skipped.
    pub fn records_in(&self, shard: u64) -> io::Result<Vec<RecordEntry>> {
        let dir = self.shard_path(shard);
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            match RecordName::parse(&name) {
                Some(parsed) => records.push(RecordEntry {
                    key: RecordKey {
                        shard,
                        seq: parsed.seq,
                    },
                    flags: parsed.flags,
                    path: entry.path(),
                }),
                None => warn!(file = %entry.path().display(), "Ignoring unrecognized file in shard"),
            }
        }
        records.sort_by_key(|r| r.key);
        Ok(records)
    }

    /// Every record in the store, in ordinal order.
    pub fn walk(&self) -> io::Result<Vec<RecordEntry>> {
        let mut all = Vec::new();
        for shard in self.shards()? {
            all.extend(self.records_in(shard)?);
        }
        Ok(all)
    }

    /// Position for the next record: after the last record of the newest
    /// shard, or the start of a new shard when that one is full.
    /// Creates shard directories as needed.
    pub fn next_key(&self) -> io::Result<RecordKey> {
        let shards = self.shards()?;
        let newest = match shards.last() {
            Some(&n) => n,
            None => {
                fs::create_dir_all(self.shard_path(0))?;
                return Ok(RecordKey { shard: 0, seq: 0 });
            }
        };

        let records = self.records_in(newest)?;
        match records.last() {
            None => Ok(RecordKey {
                shard: newest,
                seq: 0,
            }),
            Some(last) if records.len() < self.capacity => Ok(RecordKey {
                shard: newest,
                seq: last.key.seq + 1,
            }),
            Some(_) => {
                let shard = newest + 1;
                fs::create_dir_all(self.shard_path(shard))?;
                Ok(RecordKey { shard, seq: 0 })
            }
        }
    }

    /// Rename a record to carry `flags`. Returns the new path.
    pub fn set_flags(&self, entry: &RecordEntry, flags: RecordFlags) -> io::Result<PathBuf> {
        let new_path = self.record_path(entry.key, flags);
        if new_path != entry.path {
            fs::rename(&entry.path, &new_path)?;
        }
        Ok(new_path)
    }

    /// Remove a shard directory if nothing is left in it. Returns whether
    /// it was removed.
    pub fn remove_shard_if_empty(&self, shard: u64) -> io::Result<bool> {
        let dir = self.shard_path(shard);
        if fs::read_dir(&dir)?.next().is_some() {
            return Ok(false);
        }
        fs::remove_dir(&dir)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flag_suffix_is_sorted() {
        assert_eq!(RecordFlags::NONE.suffix(), "");
        assert_eq!(RecordFlags::HELD.suffix(), "h");
        assert_eq!(RecordFlags::BROKEN.suffix(), "b");
        assert_eq!(RecordFlags::HELD.with_broken(true).suffix(), "bh");
    }

    #[test]
    fn test_record_name_parse() {
        assert_eq!(
            RecordName::parse("12"),
            Some(RecordName::new(12, RecordFlags::NONE))
        );
        assert_eq!(
            RecordName::parse("3_h"),
            Some(RecordName::new(3, RecordFlags::HELD))
        );
        assert_eq!(
            RecordName::parse("3_hb"),
            Some(RecordName::new(3, RecordFlags::HELD.with_broken(true)))
        );
        assert_eq!(RecordName::parse("3.tmp"), None);
        assert_eq!(RecordName::parse("3_x"), None);
        assert_eq!(RecordName::parse("abc"), None);
        assert_eq!(RecordName::parse("_h"), None);
        assert_eq!(RecordName::parse("+4"), None);
    }

    #[test]
    fn test_record_name_file_name() {
        assert_eq!(RecordName::new(7, RecordFlags::NONE).file_name(), "7");
        assert_eq!(RecordName::new(7, RecordFlags::BROKEN).file_name(), "7_b");
        assert_eq!(RecordName::new(7, RecordFlags::NONE).tmp_file_name(), "7.tmp");
    }

    #[test]
    fn test_record_key_ordering() {
        let a = RecordKey { shard: 0, seq: 999 };
        let b = RecordKey { shard: 1, seq: 0 };
        assert!(a < b);
    }

    #[test]
    fn test_walk_is_numeric_not_lexical() {
        let tmp = TempDir::new().unwrap();
        let layout = ShardLayout::new(tmp.path(), 1000);
        for shard in ["2", "10"] {
            fs::create_dir_all(tmp.path().join(shard)).unwrap();
        }
        for name in ["9", "10_h", "100", "11.tmp"] {
            fs::write(tmp.path().join("2").join(name), b"x").unwrap();
        }
        fs::write(tmp.path().join("10").join("0"), b"x").unwrap();

        let keys: Vec<(u64, u64)> = layout
            .walk()
            .unwrap()
            .iter()
            .map(|r| (r.key.shard, r.key.seq))
            .collect();
        assert_eq!(keys, vec![(2, 9), (2, 10), (2, 100), (10, 0)]);
    }

    #[test]
    fn test_next_key_rolls_over_full_shard() {
        let tmp = TempDir::new().unwrap();
        let layout = ShardLayout::new(tmp.path(), 2);

        let k0 = layout.next_key().unwrap();
        assert_eq!(k0, RecordKey { shard: 0, seq: 0 });
        fs::write(layout.record_path(k0, RecordFlags::NONE), b"x").unwrap();

        let k1 = layout.next_key().unwrap();
        assert_eq!(k1, RecordKey { shard: 0, seq: 1 });
        fs::write(layout.record_path(k1, RecordFlags::HELD), b"x").unwrap();

        let k2 = layout.next_key().unwrap();
        assert_eq!(k2, RecordKey { shard: 1, seq: 0 });
        assert!(layout.shard_path(1).is_dir());
    }

    #[test]
    fn test_next_key_ignores_tmp_files_for_capacity() {
        let tmp = TempDir::new().unwrap();
        let layout = ShardLayout::new(tmp.path(), 2);
        let k0 = layout.next_key().unwrap();
        fs::write(layout.record_path(k0, RecordFlags::NONE), b"x").unwrap();
        fs::write(layout.tmp_path(RecordKey { shard: 0, seq: 1 }), b"partial").unwrap();

        assert_eq!(layout.next_key().unwrap(), RecordKey { shard: 0, seq: 1 });
    }

    #[test]
    fn test_set_flags_renames() {
        let tmp = TempDir::new().unwrap();
        let layout = ShardLayout::new(tmp.path(), 10);
        let key = layout.next_key().unwrap();
        let path = layout.record_path(key, RecordFlags::NONE);
        fs::write(&path, b"x").unwrap();

        let entry = RecordEntry {
            key,
            flags: RecordFlags::NONE,
            path,
        };
        let held = layout.set_flags(&entry, RecordFlags::HELD).unwrap();
        assert!(held.ends_with("0/0_h"));
        assert!(held.exists());
        assert!(!entry.path.exists());
    }

    #[test]
    fn test_remove_shard_if_empty() {
        let tmp = TempDir::new().unwrap();
        let layout = ShardLayout::new(tmp.path(), 10);
        fs::create_dir_all(layout.shard_path(0)).unwrap();
        fs::create_dir_all(layout.shard_path(1)).unwrap();
        fs::write(layout.shard_path(1).join("0"), b"x").unwrap();

        assert!(layout.remove_shard_if_empty(0).unwrap());
        assert!(!layout.remove_shard_if_empty(1).unwrap());
        assert_eq!(layout.shards().unwrap(), vec![1]);
    }
}
