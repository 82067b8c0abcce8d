// FUSE adapter - bridges sync FUSE callbacks to the async virtual filesystem
//
// fuser invokes callbacks on its own session thread, outside any runtime, so
// each callback blocks on the runtime handle captured when the mount was
// created. It handles:
// - Inode to path mapping
// - Open file and directory handle tables
// - FsError to errno translation

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileType as FuseFileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request,
};
use tokio::runtime::Handle;

use crate::fs::path::join_path;
use crate::fs::{DirEntry, File, FileType, Filesystem, FsError, IoFlags, Stat, StatRequest};

/// Default TTL for file attributes (1 second)
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Default TTL for directory entries (1 second)
const ENTRY_TTL: Duration = Duration::from_secs(1);

const ROOT_INODE: u64 = 1;

/// Manages inode <-> path bidirectional mapping
struct InodeMap {
    inode_to_path: HashMap<u64, String>,
    path_to_inode: HashMap<String, u64>,
    next_inode: u64,
}

impl InodeMap {
    fn new() -> Self {
        let mut map = Self {
            inode_to_path: HashMap::new(),
            path_to_inode: HashMap::new(),
            next_inode: ROOT_INODE + 1,
        };
        map.insert(ROOT_INODE, "/".to_string());
        map
    }

    fn insert(&mut self, inode: u64, path: String) {
        self.inode_to_path.insert(inode, path.clone());
        self.path_to_inode.insert(path, inode);
    }

    fn get_or_create(&mut self, path: &str) -> u64 {
        if let Some(&inode) = self.path_to_inode.get(path) {
            return inode;
        }

        let inode = self.next_inode;
        self.next_inode += 1;
        self.insert(inode, path.to_string());
        inode
    }

    fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(|s| s.as_str())
    }

    fn remove_path(&mut self, path: &str) {
        if let Some(inode) = self.path_to_inode.remove(path) {
            self.inode_to_path.remove(&inode);
        }
    }

    /// Re-key `from` and everything below it under `to`.
    fn rename(&mut self, from: &str, to: &str) {
        self.remove_path(to);
        let prefix = format!("{from}/");
        let moved: Vec<(u64, String)> = self
            .inode_to_path
            .iter()
            .filter(|(_, p)| p.as_str() == from || p.starts_with(&prefix))
            .map(|(&inode, p)| (inode, format!("{to}{}", &p[from.len()..])))
            .collect();
        for (inode, path) in moved {
            if let Some(old) = self.inode_to_path.remove(&inode) {
                self.path_to_inode.remove(&old);
            }
            self.insert(inode, path);
        }
    }
}

/// fuser filesystem serving one namespace.
pub struct FuseAdapter {
    fs: Arc<dyn Filesystem>,
    runtime: Handle,
    inodes: InodeMap,
    files: HashMap<u64, Box<dyn File>>,
    directories: HashMap<u64, Vec<DirEntry>>,
    next_handle: u64,
}

impl FuseAdapter {
    pub fn new(fs: Arc<dyn Filesystem>, runtime: Handle) -> Self {
        Self {
            fs,
            runtime,
            inodes: InodeMap::new(),
            files: HashMap::new(),
            directories: HashMap::new(),
            next_handle: 1,
        }
    }

    fn get_path(&self, inode: u64) -> Result<String, libc::c_int> {
        self.inodes.get_path(inode).map(|s| s.to_string()).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, libc::c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(join_path(&self.get_path(parent)?, name))
    }

    fn block_on<F, T>(&self, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.runtime.block_on(future)
    }

    fn allocate_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn stat(&self, path: &str) -> Result<Stat, FsError> {
        self.block_on(self.fs.info(path, StatRequest::ALL)).map(|(stat, _)| stat)
    }

    /// Stat a freshly named path and register its inode.
    fn entry(&mut self, path: &str, req: &Request<'_>) -> Result<fuser::FileAttr, libc::c_int> {
        let stat = self.stat(path).map_err(|e| e.to_errno())?;
        let inode = self.inodes.get_or_create(path);
        Ok(to_fuse_attr(inode, &stat, req.uid(), req.gid()))
    }
}

fn to_fuse_kind(kind: FileType) -> FuseFileType {
    match kind {
        FileType::RegularFile => FuseFileType::RegularFile,
        FileType::Directory => FuseFileType::Directory,
        FileType::Symlink => FuseFileType::Symlink,
    }
}

fn to_fuse_attr(inode: u64, stat: &Stat, uid: u32, gid: u32) -> fuser::FileAttr {
    let modified = stat.modified.map(datetime_to_systemtime).unwrap_or(UNIX_EPOCH);
    fuser::FileAttr {
        ino: inode,
        size: stat.size,
        blocks: if stat.blocks > 0 { stat.blocks } else { stat.size.div_ceil(512) },
        atime: modified,
        mtime: modified,
        ctime: modified,
        crtime: UNIX_EPOCH,
        kind: to_fuse_kind(stat.kind),
        perm: (stat.permissions & 0o7777) as u16,
        nlink: if stat.kind == FileType::Directory { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: stat.block_size,
        flags: 0,
    }
}

/// Convert chrono DateTime to SystemTime
fn datetime_to_systemtime(dt: chrono::DateTime<chrono::Utc>) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(dt.timestamp().max(0) as u64)
}

impl fuser::Filesystem for FuseAdapter {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        tracing::info!("FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        for (_, mut file) in self.files.drain() {
            if let Err(e) = self.runtime.block_on(file.close()) {
                tracing::warn!(error = %e, "close on destroy failed");
            }
        }
        if let Err(e) = self.runtime.block_on(self.fs.close()) {
            tracing::debug!(error = %e, "namespace close on destroy failed");
        }
        tracing::info!("FUSE filesystem destroyed");
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.child_path(parent, name).and_then(|path| self.entry(&path, req));
        match result {
            Ok(attr) => reply.entry(&ENTRY_TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.get_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match self.stat(&path) {
            Ok(stat) => reply.attr(&ATTR_TTL, &to_fuse_attr(ino, &stat, req.uid(), req.gid())),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.get_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match self.block_on(self.fs.extract_link(&path)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let result = self
            .block_on(self.fs.make_directory(&path))
            .map_err(|e| e.to_errno())
            .and_then(|()| self.entry(&path, req));
        match result {
            Ok(attr) => reply.entry(&ENTRY_TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        // links and files are removed through different calls
        let result = match self.stat(&path) {
            Ok(stat) if stat.kind == FileType::Symlink => self.block_on(self.fs.remove_link(&path)),
            Ok(_) => self.block_on(self.fs.remove(&path)),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match self.block_on(self.fs.remove_directory(&path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (path, target) = match (self.child_path(parent, link_name), target.to_str()) {
            (Ok(p), Some(t)) => (p, t.to_string()),
            (Err(e), _) => {
                reply.error(e);
                return;
            }
            (_, None) => {
                reply.error(libc::EINVAL);
                return;
            }
        };

        let result = self
            .block_on(self.fs.make_link(&path, &target))
            .map_err(|e| e.to_errno())
            .and_then(|()| self.entry(&path, req));
        match result {
            Ok(attr) => reply.entry(&ENTRY_TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let paths = self.child_path(parent, name).and_then(|from| {
            self.child_path(newparent, newname).map(|to| (from, to))
        });
        let (from, to) = match paths {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match self.block_on(self.fs.rename(&from, &to)) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.get_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match self.block_on(self.fs.open(&path, IoFlags::from_open_flags(flags))) {
            Ok(file) => {
                let fh = self.allocate_handle();
                self.files.insert(fh, file);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(file) = self.files.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        match self.runtime.block_on(file.read(offset.max(0) as u64, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(file) = self.files.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        match self.runtime.block_on(file.write(offset.max(0) as u64, data)) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.files.remove(&fh) {
            Some(mut file) => match self.runtime.block_on(file.close()) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.get_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        // entries are snapshotted so offsets stay stable across readdir calls
        let result = self.block_on(async {
            let mut directory = self.fs.open_directory(&path).await?;
            let entries = directory.entries().await;
            directory.close().await?;
            entries
        });
        match result {
            Ok(entries) => {
                let fh = self.allocate_handle();
                self.directories.insert(fh, entries);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.get_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let Some(entries) = self.directories.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        let parent = match path.rsplit_once('/') {
            Some(("", _)) | None => "/".to_string(),
            Some((parent, _)) => parent.to_string(),
        };
        let parent_inode = if ino == ROOT_INODE { ROOT_INODE } else { self.inodes.get_or_create(&parent) };

        let mut listing = vec![
            (ino, FuseFileType::Directory, ".".to_string()),
            (parent_inode, FuseFileType::Directory, "..".to_string()),
        ];
        let children: Vec<(String, FuseFileType)> =
            entries.iter().map(|e| (e.name.clone(), to_fuse_kind(e.kind))).collect();
        for (name, kind) in children {
            let inode = self.inodes.get_or_create(&join_path(&path, &name));
            listing.push((inode, kind, name));
        }

        for (i, (inode, kind, name)) in listing.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(*inode, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.directories.remove(&fh);
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let opened = self.block_on(async {
            self.fs.make(&path).await?;
            self.fs.open(&path, IoFlags::from_open_flags(flags)).await
        });
        let result = opened
            .map_err(|e| e.to_errno())
            .and_then(|file| self.entry(&path, req).map(|attr| (attr, file)));
        match result {
            Ok((attr, file)) => {
                let fh = self.allocate_handle();
                self.files.insert(fh, file);
                reply.created(&ENTRY_TTL, &attr, 0, fh, 0);
            }
            Err(errno) => reply.error(errno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_map_new() {
        let map = InodeMap::new();
        assert_eq!(map.get_path(ROOT_INODE), Some("/"));
        assert_eq!(map.next_inode, 2);
    }

    #[test]
    fn test_inode_map_get_or_create() {
        let mut map = InodeMap::new();
        let ino1 = map.get_or_create("/test");
        let ino2 = map.get_or_create("/test");
        assert_eq!(ino1, ino2);
        assert_eq!(map.get_path(ino1), Some("/test"));
    }

    #[test]
    fn test_inode_map_remove_path() {
        let mut map = InodeMap::new();
        let ino = map.get_or_create("/test");
        map.remove_path("/test");
        assert_eq!(map.get_path(ino), None);
    }

    #[test]
    fn test_inode_map_rename_moves_children() {
        let mut map = InodeMap::new();
        let dir = map.get_or_create("/a");
        let child = map.get_or_create("/a/b");
        let sibling = map.get_or_create("/ab");

        map.rename("/a", "/z");
        assert_eq!(map.get_path(dir), Some("/z"));
        assert_eq!(map.get_path(child), Some("/z/b"));
        assert_eq!(map.get_path(sibling), Some("/ab"));
        assert_eq!(map.get_or_create("/z/b"), child);
    }

    #[test]
    fn test_to_fuse_attr() {
        let stat = Stat { kind: FileType::Directory, permissions: 0o555, ..Stat::default() };
        let attr = to_fuse_attr(7, &stat, 1000, 1000);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, FuseFileType::Directory);
        assert_eq!(attr.perm, 0o555);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.blksize, 4096);

        let file = Stat { size: 1025, ..Stat::default() };
        assert_eq!(to_fuse_attr(8, &file, 0, 0).blocks, 3);
    }

    #[test]
    fn test_datetime_conversion() {
        let dt = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let st = datetime_to_systemtime(dt);
        assert_eq!(st.duration_since(UNIX_EPOCH).unwrap().as_secs(), 1_700_000_000);
    }
}
