use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::stream::DataMessage;
use crate::{Error, RECORD_LEN};

/// Codec for chain KV messages: a 4-byte big-endian length prefix
/// followed by a JSON payload.
pub fn chain_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(1 << 20)
        .new_codec()
}

/// Codec for mapper→reducer records. Every frame is exactly RECORD_LEN
/// bytes: a JSON payload followed by zero padding. Fixed-size frames keep
/// the reducer's read loop trivially aligned with the writer.
#[derive(Debug, Default)]
pub struct RecordCodec;

impl Encoder<DataMessage> for RecordCodec {
    type Error = Error;

    fn encode(&mut self, message: DataMessage, dst: &mut BytesMut) -> Result<(), Error> {
        let body = serde_json::to_vec(&message)?;
        if body.len() > RECORD_LEN {
            return Err(Error::Oversize {
                len: body.len(),
                max: RECORD_LEN,
            });
        }
        dst.reserve(RECORD_LEN);
        dst.put_slice(&body);
        dst.put_bytes(0, RECORD_LEN - body.len());
        Ok(())
    }
}

impl Decoder for RecordCodec {
    type Item = DataMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DataMessage>, Error> {
        if src.len() < RECORD_LEN {
            return Ok(None);
        }
        let frame = src.split_to(RECORD_LEN);

        // Serialized JSON never contains a raw NUL, so the payload ends at
        // the last non-zero byte.
        let end = frame.iter().rposition(|b| *b != 0).ok_or(Error::EmptyFrame)?;
        Ok(Some(serde_json::from_slice(&frame[..=end])?))
    }
}
