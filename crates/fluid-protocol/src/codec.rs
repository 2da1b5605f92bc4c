//! NUL-delimited JSON framing for the IPC stream.
//!
//! Each serialized message is followed by a single NUL byte. There is no
//! length prefix; receivers split on NUL and treat empty fragments as
//! separators. A read may carry several messages plus an incomplete tail,
//! which stays buffered until its terminator arrives.

use crate::IpcMessage;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame terminator appended to every serialized message.
pub const FRAME_TERMINATOR: u8 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encoder/decoder for NUL-terminated JSON frames.
#[derive(Debug, Default)]
pub struct IpcCodec;

/// Serialize one message into a ready-to-write frame (JSON + terminator).
pub fn frame(msg: &IpcMessage) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(FRAME_TERMINATOR);
    Ok(bytes)
}

impl Encoder<IpcMessage> for IpcCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: IpcMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let json = serde_json::to_vec(&msg)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(FRAME_TERMINATOR);
        Ok(())
    }
}

impl Decoder for IpcCodec {
    type Item = IpcMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<IpcMessage>, CodecError> {
        loop {
            match src.iter().position(|b| *b == FRAME_TERMINATOR) {
                None => return Ok(None),
                // Empty fragment: consecutive terminators act as separators.
                Some(0) => src.advance(1),
                Some(end) => {
                    let frame = src.split_to(end);
                    src.advance(1);
                    return Ok(Some(serde_json::from_slice(&frame)?));
                }
            }
        }
    }
}
