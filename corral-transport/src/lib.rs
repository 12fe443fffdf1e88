//! Cross-process transport: a blocking TCP client/server pair with framed
//! messaging, an optional GPU-memory fast path for numeric buffers, and the
//! process utilities (`flock`, spawn-with-pipes) that round out the
//! cross-process surface.

pub mod client;
pub mod error;
pub mod fastpath;
pub mod framing;
pub mod numeric;
pub mod options;
pub mod process;
pub mod select;
pub mod server;
pub mod tcp;

pub mod prelude {
    pub use crate::client::Client;
    pub use crate::error::{Result, TransportError};
    pub use crate::fastpath::{CopyContext, DeviceBackend, DeviceHandle, NullDeviceBackend};
    pub use crate::numeric::TensorDescriptor;
    pub use crate::options::{FastPathCachePolicy, TransportOptions};
    pub use crate::process::{fork_process, getpid, getppid, gettid, wait_pid, FileLock, Spawn, StdoutRead};
    pub use crate::server::{Connection, Server};
}
