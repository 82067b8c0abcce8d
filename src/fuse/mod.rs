// FUSE host
//
// Mounts a namespace at a host path through the kernel's FUSE interface.

pub mod adapter;
pub mod attacher;
pub mod mount;

pub use adapter::FuseAdapter;
pub use attacher::FuseAttacher;
pub use mount::{FuseRequest, MountOptions};
