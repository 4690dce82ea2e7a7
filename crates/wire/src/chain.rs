//! Messages of the chain-replicated KV protocol: framed JSON over TCP,
//! dispatched on the `type` field.

use serde::{Deserialize, Serialize};

/// Status string of a successful reply. Anything else is a server-side
/// error description.
pub const OK: &str = "OK";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "SET")]
    Set {
        key: String,
        val: String,
        /// Version assigned by the chain head. Present only on
        /// inter-replica hops; clients never send it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ver: Option<u64>,
    },
    #[serde(rename = "GET")]
    Get { key: String },
    #[serde(rename = "VER_GET")]
    VerGet { key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<u64>,
}

impl SetResponse {
    pub fn ok(ver: u64) -> Self {
        Self {
            status: OK.to_string(),
            ver: Some(ver),
        }
    }

    pub fn error(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ver: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OK
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<String>,
}

impl GetResponse {
    pub fn ok(val: impl Into<String>) -> Self {
        Self {
            status: OK.to_string(),
            val: Some(val.into()),
        }
    }

    pub fn error(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            val: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OK
    }
}

/// Reply to VER_GET. A hit carries no status field, so the two shapes are
/// distinguished structurally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VerGetResponse {
    Found { key: String, ver: u64 },
    Missing { status: String, message: String },
}

impl VerGetResponse {
    pub fn missing(message: impl Into<String>) -> Self {
        Self::Missing {
            status: "Error".to_string(),
            message: message.into(),
        }
    }
}
