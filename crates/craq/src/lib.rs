//! A chain-replicated key-value store with apportioned queries: writes
//! flow head→tail through an ordered chain of replicas, and any replica
//! can serve a strongly consistent read by consulting the tail only when
//! its local entry is dirty.

mod chains;
mod client;
mod replica;
mod store;

pub use chains::Chains;
pub use client::Client;
pub use replica::{Position, Replica};
pub use store::{Entry, Store};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("peer closed the connection mid-request")]
    UnexpectedEof,
    #[error("{0}")]
    Status(String),
}
