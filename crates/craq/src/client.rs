use std::net::SocketAddr;

use crate::Chains;
use wire::chain::{GetResponse, Request, SetResponse};

/// Client-side router for a replica chain: SETs go to the head, GETs
/// round-robin across every replica.
pub struct Client {
    chain: Vec<SocketAddr>,
    chains: Chains,
    cursor: std::sync::Mutex<usize>,
}

impl Client {
    /// `chain` is ordered head first, tail last.
    pub fn new(chain: Vec<SocketAddr>) -> Self {
        assert!(!chain.is_empty(), "a chain has at least one replica");
        Self {
            chain,
            chains: Chains::default(),
            cursor: std::sync::Mutex::new(0),
        }
    }

    /// Write `key`, returning the version the chain assigned.
    pub async fn set(&self, key: &str, val: &str) -> crate::Result<u64> {
        let request = Request::Set {
            key: key.to_string(),
            val: val.to_string(),
            ver: None,
        };
        let response: SetResponse = self.chains.request(self.chain[0], &request).await?;
        match (response.is_ok(), response.ver) {
            (true, Some(ver)) => Ok(ver),
            _ => Err(crate::Error::Status(response.status)),
        }
    }

    /// Read `key` from whichever replica the round-robin lands on.
    pub async fn get(&self, key: &str) -> crate::Result<String> {
        let request = Request::Get {
            key: key.to_string(),
        };
        let response: GetResponse = self.chains.request(self.pick(), &request).await?;
        match (response.is_ok(), response.val) {
            (true, Some(val)) => Ok(val),
            _ => Err(crate::Error::Status(response.status)),
        }
    }

    fn pick(&self) -> SocketAddr {
        let mut cursor = self.cursor.lock().unwrap();
        let replica = self.chain[*cursor % self.chain.len()];
        *cursor += 1;
        replica
    }
}
