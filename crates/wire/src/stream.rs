//! Mapper→reducer data-channel messages. Both variants travel in-band on
//! the same TCP connection: a checkpoint marker separates the counts sent
//! before it from those sent after, which is what makes the reducer's
//! aligned snapshot a consistent cut.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg_type")]
pub enum DataMessage {
    #[serde(rename = "WORD_COUNT")]
    WordCount {
        source: String,
        key: String,
        value: u64,
        last_recovery_id: u64,
    },
    #[serde(rename = "FWD_CHECKPOINT")]
    ForwardCheckpoint {
        source: String,
        source_id: usize,
        checkpoint_id: i64,
        recovery_id: u64,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_message_wire_shapes() {
        let wc = DataMessage::WordCount {
            source: "mapper_0".to_string(),
            key: "alpha".to_string(),
            value: 2,
            last_recovery_id: 1,
        };
        assert_eq!(
            serde_json::to_value(&wc).unwrap(),
            json!({
                "msg_type": "WORD_COUNT",
                "source": "mapper_0",
                "key": "alpha",
                "value": 2,
                "last_recovery_id": 1,
            })
        );

        let marker = DataMessage::ForwardCheckpoint {
            source: "mapper_1".to_string(),
            source_id: 1,
            checkpoint_id: 3,
            recovery_id: 0,
        };
        let round_trip: DataMessage =
            serde_json::from_value(serde_json::to_value(&marker).unwrap()).unwrap();
        assert_eq!(round_trip, marker);
    }
}
