//! corral-core
//!
//! Runtime-agnostic building blocks shared by every other crate in the
//! workspace:
//! - Transactional byte ring (`ring`)
//! - Typed wire value model (`value`)
//! - Tag-framed codec over a ring (`codec`)
//! - Process-wide reference-counted handle table (`handle`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]

pub mod codec;
pub mod error;
pub mod handle;
pub mod ring;
pub mod value;

pub mod prelude {
    pub use crate::codec::{Codec, CodecMode};
    pub use crate::error::{CoreError, Result};
    pub use crate::handle::{HandleId, HandleRegistry};
    pub use crate::ring::RingBuffer;
    pub use crate::value::{FunctionValue, Table, UpvalueMode, UserdataValue, Value};
}
