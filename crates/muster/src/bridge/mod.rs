//! Wire protocol between the coordinator and its workers.
//!
//! - `protocol`: message kinds and the correlation key type
//! - `codec`: newline-delimited JSON framing over any byte stream

pub mod codec;
pub mod protocol;

pub use codec::{FrameError, JsonLinesCodec};
pub use protocol::{CoordMessage, JobKey, NodeMessage};
