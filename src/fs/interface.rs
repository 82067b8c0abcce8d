// Virtual filesystem interface
//
// Every namespace (object tree, mutable name tree, pin tree, key tree, files
// tree) is exposed through this trait. The FUSE and 9P hosts only ever talk to
// a namespace through it, and every failure is reported as an `FsError` so the
// hosts can translate it into protocol error values.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::{FsError, FsResult};

/// File type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
}

/// Metadata returned by [`Filesystem::info`].
///
/// Only the fields selected by the accompanying [`StatRequest`] are
/// meaningful; the rest keep their default value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub kind: FileType,
    pub size: u64,
    pub blocks: u64,
    pub block_size: u32,
    pub permissions: u32,
    pub modified: Option<DateTime<Utc>>,
}

impl Default for Stat {
    fn default() -> Self {
        Self {
            kind: FileType::RegularFile,
            size: 0,
            blocks: 0,
            block_size: 4096,
            permissions: 0o444,
            modified: None,
        }
    }
}

/// Selects which [`Stat`] fields a caller needs, and which ones an
/// implementation actually filled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatRequest {
    pub kind: bool,
    pub size: bool,
    pub blocks: bool,
    pub modified: bool,
}

impl StatRequest {
    pub const ALL: StatRequest = StatRequest { kind: true, size: true, blocks: true, modified: true };
    pub const KIND: StatRequest =
        StatRequest { kind: true, size: false, blocks: false, modified: false };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFlags {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl IoFlags {
    /// Interpret the access mode bits of an `open(2)` flag word
    pub fn from_open_flags(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => IoFlags::WriteOnly,
            libc::O_RDWR => IoFlags::ReadWrite,
            _ => IoFlags::ReadOnly,
        }
    }

    pub fn writable(self) -> bool {
        !matches!(self, IoFlags::ReadOnly)
    }
}

/// Directory entry structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

/// An opened file.
#[async_trait]
pub trait File: Send + Sync {
    async fn read(&mut self, offset: u64, size: u32) -> FsResult<Vec<u8>>;

    async fn write(&mut self, _offset: u64, _data: &[u8]) -> FsResult<u32> {
        Err(FsError::ReadOnly("file was not opened for writing".to_string()))
    }

    async fn size(&self) -> FsResult<u64>;

    async fn close(&mut self) -> FsResult<()> {
        Ok(())
    }
}

/// An opened directory.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn entries(&mut self) -> FsResult<Vec<DirEntry>>;

    async fn close(&mut self) -> FsResult<()> {
        Ok(())
    }
}

/// Unified virtual filesystem interface
///
/// Paths are absolute and slash separated, relative to the namespace root.
/// The namespaces are mostly read-only, so every mutating operation defaults
/// to [`FsError::ReadOnly`]; writable trees override what they support.
#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn info(&self, path: &str, request: StatRequest) -> FsResult<(Stat, StatRequest)>;
    async fn open(&self, path: &str, flags: IoFlags) -> FsResult<Box<dyn File>>;
    async fn open_directory(&self, path: &str) -> FsResult<Box<dyn Directory>>;

    async fn extract_link(&self, path: &str) -> FsResult<String> {
        Err(FsError::InvalidItem(format!("not a link: {path}")))
    }

    async fn make(&self, path: &str) -> FsResult<()> {
        Err(FsError::ReadOnly(path.to_string()))
    }

    async fn make_directory(&self, path: &str) -> FsResult<()> {
        Err(FsError::ReadOnly(path.to_string()))
    }

    async fn make_link(&self, path: &str, _target: &str) -> FsResult<()> {
        Err(FsError::ReadOnly(path.to_string()))
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        Err(FsError::ReadOnly(path.to_string()))
    }

    async fn remove_directory(&self, path: &str) -> FsResult<()> {
        Err(FsError::ReadOnly(path.to_string()))
    }

    async fn remove_link(&self, path: &str) -> FsResult<()> {
        Err(FsError::ReadOnly(path.to_string()))
    }

    async fn rename(&self, old_name: &str, _new_name: &str) -> FsResult<()> {
        Err(FsError::ReadOnly(old_name.to_string()))
    }

    /// Release resources held by the namespace itself.
    async fn close(&self) -> FsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_flags_from_open_flags() {
        assert_eq!(IoFlags::from_open_flags(libc::O_RDONLY), IoFlags::ReadOnly);
        assert_eq!(IoFlags::from_open_flags(libc::O_WRONLY | libc::O_CREAT), IoFlags::WriteOnly);
        assert_eq!(IoFlags::from_open_flags(libc::O_RDWR), IoFlags::ReadWrite);
        assert!(!IoFlags::ReadOnly.writable());
        assert!(IoFlags::ReadWrite.writable());
    }

    #[test]
    fn test_stat_default_is_read_only_file() {
        let stat = Stat::default();
        assert_eq!(stat.kind, FileType::RegularFile);
        assert_eq!(stat.permissions, 0o444);
    }
}
