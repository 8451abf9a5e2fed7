use bytes::{Bytes, BytesMut};

use crate::net::protocol::{FRAME_HEADER_LEN, FrameHeader};

/// Reassembles whole frames from a byte stream.
///
/// Socket reads append into [`buf_mut`](Self::buf_mut); complete frames are
/// split off as owned [`Bytes`] and the remainder stays buffered.
#[derive(Debug)]
pub struct StreamFramer {
    buf: BytesMut,
}

impl StreamFramer {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(initial_capacity),
        }
    }

    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn drain_frames(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while self.buf.len() >= FRAME_HEADER_LEN {
            let Ok(header) = FrameHeader::peek(&self.buf) else {
                break;
            };
            let frame_len = header.frame_len();
            if self.buf.len() < frame_len {
                self.buf.reserve(frame_len - self.buf.len());
                break;
            }
            frames.push(self.buf.split_to(frame_len).freeze());
        }
        frames
    }
}
