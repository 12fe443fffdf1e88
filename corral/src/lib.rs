//! # corral
//!
//! Thread-blocking IPC primitives for parallel compute workers, built as a
//! thin facade over three layered crates:
//!
//! - [`corral_core`]: the transactional ring buffer, the tagged `Value` wire
//!   format, and the process-wide handle table.
//! - [`corral_sync`]: `Channel`, `WorkQueue`, the recursive `Mutex`/barrier,
//!   `SharedTable`, and `MapPool` — everything built on `std::thread` and
//!   `parking_lot`.
//! - [`corral_transport`]: the TCP `Server`/`Client` pair, the numeric
//!   (tensor) wire codec with its optional GPU fast path, and the process
//!   utilities (`flock`, spawn-with-pipes) that live alongside it.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use corral::{Server, Client, TransportOptions, HandleRegistry, Value};
//!
//! # fn main() -> Result<(), corral::Error> {
//! let mut server = Server::bind("127.0.0.1", 0, TransportOptions::default())?;
//! let port = server.port();
//!
//! let mut client = Client::connect_host_only("127.0.0.1", port, TransportOptions::default())?;
//! let handles = HandleRegistry::new();
//! client.send(&handles, &Value::Bool(true))?;
//!
//! server.accept_until(1)?;
//! let value = server.connection_mut(0).unwrap().recv(&handles)?;
//! assert!(matches!(value, Value::Bool(true)));
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub use corral_core::codec::{Codec, CodecMode};
pub use corral_core::handle::{HandleId, HandleRegistry};
pub use corral_core::ring::RingBuffer;
pub use corral_core::value::{FunctionValue, Table, UpvalueMode, UserdataValue, Value};

pub use corral_sync::channel::{Channel, Status as ChannelStatus};
pub use corral_sync::map_pool::{MapFn, MapPool, PreInit};
pub use corral_sync::mutex::Mutex;
pub use corral_sync::options::ChannelOptions;
pub use corral_sync::shared_table::{PairsCursor, SharedTable};
pub use corral_sync::workqueue::WorkQueue;

pub use corral_transport::client::Client;
pub use corral_transport::fastpath::{CopyContext, DeviceBackend, DeviceHandle, NullDeviceBackend};
pub use corral_transport::numeric::TensorDescriptor;
pub use corral_transport::options::{FastPathCachePolicy, TransportOptions};
pub use corral_transport::process::{fork_process, getpid, getppid, gettid, wait_pid, FileLock, Spawn, StdoutRead};
pub use corral_transport::server::{Connection, Server};

/// Development helpers (benches/tests)
pub mod dev_tracing;

mod error;
pub use error::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
