// SuperNova Lightning Network - Message Framing
//
// Each message travels as a u16 big-endian length followed by its bytes.

use super::{Message, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Encode a message and prepend its length.
pub fn frame(message: &Message) -> Result<Bytes, WireError> {
    let body = message.encode()?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    let mut out = BytesMut::with_capacity(body.len() + 2);
    out.put_u16(body.len() as u16);
    out.put_slice(&body);
    Ok(out.freeze())
}

/// Reassembles frames from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame body, if one is buffered.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(len).freeze())
    }

    /// Pop and decode the next complete message.
    pub fn next_message(&mut self) -> Result<Option<Message>, WireError> {
        match self.next_frame() {
            Some(body) => Message::decode(&body).map(Some),
            None => Ok(None),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Ping, Pong};

    #[test]
    fn test_split_frames_reassemble() {
        let ping = Message::Ping(Ping { num_pong_bytes: 2, ignored: vec![0; 3] });
        let pong = Message::Pong(Pong { ignored: vec![0; 2] });
        let mut stream = frame(&ping).unwrap().to_vec();
        stream.extend_from_slice(&frame(&pong).unwrap());

        let mut decoder = FrameDecoder::new();
        let mut seen = Vec::new();
        for byte in stream {
            decoder.push(&[byte]);
            while let Some(message) = decoder.next_message().unwrap() {
                seen.push(message);
            }
        }
        assert_eq!(seen, vec![ping, pong]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let ping = Message::Ping(Ping {
            num_pong_bytes: 0,
            ignored: vec![0; MAX_FRAME_LEN - 4],
        });
        assert!(matches!(frame(&ping), Err(WireError::FrameTooLarge(_))));
    }
}
