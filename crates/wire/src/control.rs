//! Worker↔coordinator control traffic: single JSON datagrams, dispatched
//! on the `msg_type` field, type-specific fields flattened into the
//! message object.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg_type")]
pub enum ControlMessage {
    #[serde(rename = "HEARTBEAT")]
    Heartbeat { source: String },
    #[serde(rename = "CHECKPOINT")]
    Checkpoint {
        source: String,
        checkpoint_id: i64,
        recovery_id: u64,
    },
    #[serde(rename = "CHECKPOINT_ACK")]
    CheckpointAck { source: String, checkpoint_id: i64 },
    #[serde(rename = "LAST_CHECKPOINT_ACK")]
    LastCheckpointAck { source: String, checkpoint_id: i64 },
    #[serde(rename = "RECOVER")]
    Recover {
        source: String,
        checkpoint_id: i64,
        recovery_id: u64,
    },
    #[serde(rename = "RECOVERY_ACK")]
    RecoveryAck { source: String, recovery_id: u64 },
    #[serde(rename = "EXIT")]
    Exit { source: String },
    #[serde(rename = "DONE")]
    Done { source: String },
}

impl ControlMessage {
    /// The worker or coordinator this message originated from.
    pub fn source(&self) -> &str {
        match self {
            Self::Heartbeat { source }
            | Self::Checkpoint { source, .. }
            | Self::CheckpointAck { source, .. }
            | Self::LastCheckpointAck { source, .. }
            | Self::Recover { source, .. }
            | Self::RecoveryAck { source, .. }
            | Self::Exit { source }
            | Self::Done { source } => source,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, crate::Error> {
        let buf = serde_json::to_vec(self)?;
        if buf.len() > crate::DATAGRAM_LEN {
            return Err(crate::Error::Oversize {
                len: buf.len(),
                max: crate::DATAGRAM_LEN,
            });
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, crate::Error> {
        Ok(serde_json::from_slice(buf)?)
    }
}
