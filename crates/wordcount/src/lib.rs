//! A fault-tolerant distributed word-count engine: mappers read partitions
//! of an input stream and hash-partition counts over durable TCP links to
//! reducers, which align Chandy–Lamport checkpoint markers and aggregate
//! across recovery epochs under a coordinator's direction.

pub mod broker;
pub mod checkpoint;
pub mod coordinator;
pub mod mapper;
pub mod reducer;

mod net;
mod partition;

pub use partition::route_word;
