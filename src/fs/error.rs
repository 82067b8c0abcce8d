use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

/// Error taxonomy shared by every virtual filesystem.
///
/// Host protocol adapters translate these into FUSE errno values or
/// 9P2000.L error replies; see [`FsError::to_errno`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("{0}")]
    Other(String),

    #[error("Invalid item: {0}")]
    InvalidItem(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Already exists: {0}")]
    Exist(String),

    #[error("Path not found: {0}")]
    NotExist(String),

    #[error("Is a directory: {0}")]
    IsDir(String),

    #[error("Not a directory: {0}")]
    NotDir(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Read-only file system: {0}")]
    ReadOnly(String),
}

impl FsError {
    /// Convert to POSIX errno
    ///
    /// 9P2000.L replies carry Linux errno values as well, so both host
    /// protocols use the same table.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::Other(_) => libc::EIO,
            FsError::InvalidItem(_) => libc::EINVAL,
            FsError::InvalidOperation(_) => libc::ENOSYS,
            FsError::Permission(_) => libc::EACCES,
            FsError::Io(_) => libc::EIO,
            FsError::Exist(_) => libc::EEXIST,
            FsError::NotExist(_) => libc::ENOENT,
            FsError::IsDir(_) => libc::EISDIR,
            FsError::NotDir(_) => libc::ENOTDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::ReadOnly(_) => libc::EROFS,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let msg = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => FsError::NotExist(msg),
            ErrorKind::AlreadyExists => FsError::Exist(msg),
            ErrorKind::PermissionDenied => FsError::Permission(msg),
            ErrorKind::InvalidInput => FsError::InvalidItem(msg),
            ErrorKind::Unsupported => FsError::InvalidOperation(msg),
            ErrorKind::ReadOnlyFilesystem => FsError::ReadOnly(msg),
            ErrorKind::IsADirectory => FsError::IsDir(msg),
            ErrorKind::NotADirectory => FsError::NotDir(msg),
            ErrorKind::DirectoryNotEmpty => FsError::NotEmpty(msg),
            _ => FsError::Io(msg),
        }
    }
}
