//! Core store types.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// File attributes (metadata).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Size in bytes.
    pub size: u64,
    /// File type.
    pub kind: FileType,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last access time (optional).
    pub atime: Option<SystemTime>,
    /// Creation time (optional).
    pub ctime: Option<SystemTime>,
}

impl FileAttr {
    /// Synthetic record for the store root: an empty directory at the epoch.
    pub fn root() -> Self {
        Self {
            size: 0,
            kind: FileType::Directory,
            mtime: SystemTime::UNIX_EPOCH,
            atime: Some(SystemTime::UNIX_EPOCH),
            ctime: Some(SystemTime::UNIX_EPOCH),
        }
    }

    /// Build attributes from local metadata.
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        let kind = if meta.is_dir() {
            FileType::Directory
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else {
            FileType::File
        };

        Self {
            size: meta.len(),
            kind,
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            atime: meta.accessed().ok(),
            ctime: meta.created().ok(),
        }
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry type.
    pub kind: FileType,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, kind: FileType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Create a file entry.
    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, FileType::File)
    }

    /// Create a directory entry.
    pub fn directory(name: impl Into<String>) -> Self {
        Self::new(name, FileType::Directory)
    }
}

/// How `open_write` treats an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteMode {
    /// Replace the contents (create if missing).
    #[default]
    Truncate,
    /// Append to the contents (create if missing).
    Append,
    /// Fail with `AlreadyExists` if the file is present.
    CreateNew,
}

/// Options for copy and rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyOptions {
    /// Overwrite an existing target instead of failing.
    pub replace_existing: bool,
}

impl CopyOptions {
    /// Overwrite the target if it exists.
    pub fn replace() -> Self {
        Self {
            replace_existing: true,
        }
    }
}

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Regular files deleted.
    pub files_deleted: u64,
    /// Directories deleted.
    pub dirs_deleted: u64,
    /// Bytes released by deleted files.
    pub bytes_freed: u64,
    /// Deletions that failed and were skipped.
    pub failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_attr_is_epoch_directory() {
        let root = FileAttr::root();
        assert!(root.is_dir());
        assert_eq!(root.size, 0);
        assert_eq!(root.mtime, SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn test_dir_entry() {
        let file = DirEntry::file("test.txt");
        assert_eq!(file.name, "test.txt");
        assert!(file.kind.is_file());

        let dir = DirEntry::directory("subdir");
        assert!(dir.kind.is_dir());
    }

    #[test]
    fn test_write_mode_default_truncates() {
        assert_eq!(WriteMode::default(), WriteMode::Truncate);
    }
}
