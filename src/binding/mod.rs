// Binding vocabulary shared by the manager and the host attachers

pub mod address;
pub mod error;
pub mod handle;
pub mod request;
pub mod stack;

pub use address::{Address, AddressError, ListenAddr, Protocol};
pub use error::BindError;
pub use handle::{Binding, HostResponse, ReleaseHandle, Response};
pub use request::{Header, HostApi, HostRequest, Namespace, Request, RequestError};
pub use stack::{UnwindStack, Unwound};
