// hostbind: binds virtual filesystem namespaces onto host targets over FUSE
// and 9P.

pub mod binding;
pub mod config;
pub mod fs;
pub mod fuse;
pub mod manager;
pub mod ninep;
pub mod parse;
