use async_trait::async_trait;

use super::error::{FsError, FsResult};
use super::interface::{
    DirEntry, Directory, File, FileType, Filesystem, IoFlags, Stat, StatRequest,
};

/// A namespace containing nothing but its root directory.
///
/// Stands in for a namespace whose backing store is not available, so the
/// host mount still exists and lists as empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyFs;

struct EmptyDirectory;

#[async_trait]
impl Directory for EmptyDirectory {
    async fn entries(&mut self) -> FsResult<Vec<DirEntry>> {
        Ok(Vec::new())
    }
}

fn require_root(path: &str) -> FsResult<()> {
    if path == "/" { Ok(()) } else { Err(FsError::NotExist(path.to_string())) }
}

#[async_trait]
impl Filesystem for EmptyFs {
    async fn info(&self, path: &str, request: StatRequest) -> FsResult<(Stat, StatRequest)> {
        require_root(path)?;
        let stat = Stat { kind: FileType::Directory, permissions: 0o555, ..Stat::default() };
        let filled = StatRequest { kind: request.kind, size: request.size, ..StatRequest::default() };
        Ok((stat, filled))
    }

    async fn open(&self, path: &str, _flags: IoFlags) -> FsResult<Box<dyn File>> {
        require_root(path)?;
        Err(FsError::IsDir(path.to_string()))
    }

    async fn open_directory(&self, path: &str) -> FsResult<Box<dyn Directory>> {
        require_root(path)?;
        Ok(Box::new(EmptyDirectory))
    }
}
