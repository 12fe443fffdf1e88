//! corral-sync
//!
//! Thread-blocking concurrency primitives built on `corral-core`'s ring and
//! codec:
//! - [`channel`] — bounded, growable, open/closed/drained message channel
//! - [`workqueue`] — named bidirectional (questions/answers) channel pair
//! - [`mutex`] — recursive lock with a counting barrier
//! - [`shared_table`] — thread-safe associative map through a codec boundary
//! - [`map_pool`] — one-shot fan-out of worker threads

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]

pub mod channel;
pub mod error;
pub mod map_pool;
pub mod mutex;
pub mod options;
pub mod shared_table;
pub mod workqueue;

pub mod prelude {
    pub use crate::channel::{Channel, Status};
    pub use crate::error::{Result, SyncError};
    pub use crate::map_pool::{MapFn, MapPool, PreInit};
    pub use crate::mutex::Mutex;
    pub use crate::options::ChannelOptions;
    pub use crate::shared_table::{PairsCursor, SharedTable};
    pub use crate::workqueue::WorkQueue;
}
