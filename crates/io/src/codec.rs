//! Wire framing of application messages.
//!
//! Every message written by a [`Connection`](crate::Connection) is a single
//! frame:
//!
//! ```text
//! +--------+---------------+-------------+---------+
//! | id_len | id            | payload_len | payload |
//! | u8     | id_len bytes  | u32 BE      |         |
//! +--------+---------------+-------------+---------+
//! ```
//!
//! A zero `id_len` addresses the untagged channel.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::IoError, msg_id::MsgId};

const ID_LEN_SIZE: usize = 1;
const PAYLOAD_LEN_SIZE: usize = 4;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Identifier of the channel, `None` for untagged traffic.
    pub id: Option<MsgId>,
    /// Frame payload.
    pub payload: Bytes,
}

/// A frame to be encoded, borrowing its contents.
#[derive(Debug, Clone, Copy)]
pub struct FrameRef<'a> {
    /// Identifier of the channel, `None` for untagged traffic.
    pub id: Option<&'a MsgId>,
    /// Frame payload.
    pub payload: &'a [u8],
}

impl FrameRef<'_> {
    /// Returns the encoded length of the frame.
    pub fn encoded_len(&self) -> usize {
        header_len(self.id.map(|id| id.as_bytes().len()).unwrap_or(0)) + self.payload.len()
    }
}

/// Codec for [`Frame`]s.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    /// Creates a codec rejecting payloads longer than `max_frame_length`.
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    /// Returns the payload size limit.
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    fn check_len(&self, len: usize) -> Result<(), IoError> {
        if len > self.max_frame_length || len > u32::MAX as usize {
            return Err(IoError::frame(format!(
                "payload of {} bytes exceeds the limit of {} bytes",
                len, self.max_frame_length
            )));
        }
        Ok(())
    }
}

fn header_len(id_len: usize) -> usize {
    ID_LEN_SIZE + id_len + PAYLOAD_LEN_SIZE
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = IoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, IoError> {
        let Some(&id_len) = src.first() else {
            return Ok(None);
        };

        let id_len = id_len as usize;
        let header_len = header_len(id_len);
        if src.len() < header_len {
            return Ok(None);
        }

        let payload_len = (&src[ID_LEN_SIZE + id_len..header_len]).get_u32() as usize;
        self.check_len(payload_len)?;

        let frame_len = header_len + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(ID_LEN_SIZE);
        let id = src.split_to(id_len);
        src.advance(PAYLOAD_LEN_SIZE);
        let payload = src.split_to(payload_len).freeze();

        let id = if id.is_empty() {
            None
        } else {
            Some(MsgId::from_wire(&id)?)
        };

        Ok(Some(Frame { id, payload }))
    }
}

impl<'a> Encoder<FrameRef<'a>> for FrameCodec {
    type Error = IoError;

    fn encode(&mut self, frame: FrameRef<'a>, dst: &mut BytesMut) -> Result<(), IoError> {
        let id: &[u8] = match frame.id {
            Some(id) => {
                id.validate()?;
                id.as_bytes()
            }
            None => &[],
        };
        self.check_len(frame.payload.len())?;

        dst.reserve(frame.encoded_len());
        dst.put_u8(id.len() as u8);
        dst.put_slice(id);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(frame.payload);

        Ok(())
    }
}
