//! The mapper's view of the message broker holding the input streams.
//! The engine only ever reads forward from a cursor; whatever store backs
//! the streams stays behind this interface.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;

/// One record of an input stream.
#[derive(Debug, Clone)]
pub struct Record {
    /// Opaque cursor token. Tokens assigned within one stream are
    /// monotonically increasing.
    pub id: String,
    pub text: String,
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// The first record of `stream` after `cursor`, or None once the
    /// stream is drained. The origin cursor is [`wire::ORIGIN_CURSOR`].
    async fn read_after(&self, stream: &str, cursor: &str) -> anyhow::Result<Option<Record>>;
}

/// In-memory broker backing tests and the demo binary. Record ids are
/// 1-based positions within their stream.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    streams: HashMap<String, Vec<String>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record per non-empty line of `text`.
    pub fn load_lines(&mut self, stream: &str, text: &str) {
        let records = self.streams.entry(stream.to_string()).or_default();
        records.extend(
            text.lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string),
        );
    }

    /// Append a single record.
    pub fn push(&mut self, stream: &str, text: &str) {
        self.streams
            .entry(stream.to_string())
            .or_default()
            .push(text.to_string());
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn read_after(&self, stream: &str, cursor: &str) -> anyhow::Result<Option<Record>> {
        let after: usize = cursor
            .parse()
            .with_context(|| format!("malformed cursor {cursor:?}"))?;

        let record = self
            .streams
            .get(stream)
            .and_then(|records| records.get(after))
            .map(|text| Record {
                id: (after + 1).to_string(),
                text: text.clone(),
            });
        Ok(record)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_memory_broker_reads_forward_from_a_cursor() {
        let mut broker = MemoryBroker::new();
        broker.load_lines("words-0", "alpha beta\n\ngamma delta\n");
        broker.push("words-0", "epsilon");

        let first = broker.read_after("words-0", "0").await.unwrap().unwrap();
        assert_eq!((first.id.as_str(), first.text.as_str()), ("1", "alpha beta"));

        let second = broker.read_after("words-0", &first.id).await.unwrap().unwrap();
        assert_eq!(second.text, "gamma delta");

        let third = broker.read_after("words-0", &second.id).await.unwrap().unwrap();
        assert_eq!(third.text, "epsilon");

        assert!(broker.read_after("words-0", &third.id).await.unwrap().is_none());
        assert!(broker.read_after("missing", "0").await.unwrap().is_none());
    }
}
