pub mod empty;
pub mod error;
pub mod interface;
pub mod path;

pub use empty::EmptyFs;
pub use error::{FsError, FsResult};
pub use interface::{
    DirEntry, Directory, File, FileType, Filesystem, IoFlags, Stat, StatRequest,
};
