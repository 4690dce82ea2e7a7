//! Wire messages and framing shared by the chain KV store and the
//! streaming engine.

pub mod chain;
pub mod control;
pub mod stream;

mod frame;
pub use frame::{chain_codec, RecordCodec};

/// Fixed length of one mapper→reducer record frame. Frames shorter than
/// this are zero-padded on the wire.
pub const RECORD_LEN: usize = 1024;

/// Largest worker↔coordinator control datagram a peer will read.
pub const DATAGRAM_LEN: usize = 1024;

/// Cursor token designating the origin of an input stream.
pub const ORIGIN_CURSOR: &str = "0";

/// Checkpoint id reserved for the final checkpoint of a job. Workers ack
/// it with LAST_CHECKPOINT_ACK instead of CHECKPOINT_ACK.
pub const LAST_CHECKPOINT_ID: i64 = 0;

/// Sentinel checkpoint id meaning "no durable checkpoint exists yet":
/// recovery restarts from the stream origin.
pub const NO_CHECKPOINT: i64 = -1;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{len}-byte message exceeds the {max}-byte frame")]
    Oversize { len: usize, max: usize },
    #[error("frame holds no message")]
    EmptyFrame,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
