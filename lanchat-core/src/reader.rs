//! Splits a raw TCP byte stream into lines and marker-tagged binary blocks.
//!
//! Bytes are buffered across deliveries. A frame is only emitted once it has
//! fully arrived; until then the reader sits in an "awaiting more bytes" state
//! and loses nothing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    CHUNK_SIZE, MAX_LINE_BYTES, ProtocolError,
    transfer::{FileHeader, ImageMessage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    FileStart,
    FileData,
    ImageMsg,
}

impl Marker {
    pub const ALL: [Marker; 3] = [Marker::FileStart, Marker::FileData, Marker::ImageMsg];

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Marker::FileStart => b"FILE_START",
            Marker::FileData => b"FILE_DATA",
            Marker::ImageMsg => b"IMAGE_MSG",
        }
    }

    fn detect(buf: &[u8]) -> Option<Marker> {
        Self::ALL
            .into_iter()
            .find(|marker| buf.starts_with(marker.as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// A line with its `\r`/`\n` terminator removed; never empty.
    Line(Bytes),
    /// Everything after a marker that belongs to that frame.
    Block { marker: Marker, payload: Bytes },
}

impl RawFrame {
    /// Re-encodes the frame exactly as it travelled on the wire.
    pub fn to_wire(&self) -> Bytes {
        match self {
            RawFrame::Line(line) => {
                let mut out = BytesMut::with_capacity(line.len() + 1);
                out.extend_from_slice(line);
                out.put_u8(b'\n');
                out.freeze()
            }
            RawFrame::Block { marker, payload } => {
                let marker = marker.as_bytes();
                let mut out = BytesMut::with_capacity(marker.len() + payload.len());
                out.extend_from_slice(marker);
                out.extend_from_slice(payload);
                out.freeze()
            }
        }
    }
}

/// `FILE_DATA` frames carry no length, so the reader cuts them at
/// [`CHUNK_SIZE`], the same size every sender uses.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    chunk_size: usize,
    max_line: usize,
    /// Data bytes announced by the last `FILE_START` and not yet framed.
    owed: u64,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            chunk_size: CHUNK_SIZE,
            max_line: MAX_LINE_BYTES,
            owed: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            ..Self::new()
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drains every complete frame currently buffered.
    pub fn pull(&mut self) -> Vec<Result<RawFrame, ProtocolError>> {
        let mut out = Vec::new();
        while let Some(item) = self.next_frame() {
            out.push(item);
        }
        out
    }

    pub fn next_frame(&mut self) -> Option<Result<RawFrame, ProtocolError>> {
        loop {
            if self.buf.is_empty() {
                return None;
            }

            if let Some(marker) = Marker::detect(&self.buf) {
                return self.next_block(marker);
            }

            let Some(pos) = self.buf.iter().position(|&byte| byte == b'\n') else {
                if self.buf.len() > self.max_line {
                    self.buf.clear();
                    return Some(Err(ProtocolError::LineTooLong { max: self.max_line }));
                }
                return None;
            };

            let mut line = self.buf.split_to(pos + 1);
            while line.last().is_some_and(|&byte| byte == b'\n' || byte == b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }
            return Some(Ok(RawFrame::Line(line.freeze())));
        }
    }

    /// Forgets all buffered bytes and any announced transfer.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.owed = 0;
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn owed(&self) -> u64 {
        self.owed
    }

    fn next_block(&mut self, marker: Marker) -> Option<Result<RawFrame, ProtocolError>> {
        let body = &self.buf[marker.as_bytes().len()..];
        let measured = match marker {
            Marker::FileStart => {
                FileHeader::parse_prefix(body).map(|(header, used)| (used, Some(header.file_size)))
            }
            Marker::ImageMsg => ImageMessage::parse_prefix(body).map(|(_, used)| (used, None)),
            Marker::FileData => Ok((self.data_frame_len(body)?, None)),
        };

        match measured {
            Ok((len, announced)) => {
                self.buf.advance(marker.as_bytes().len());
                let payload = self.buf.split_to(len).freeze();
                match (marker, announced) {
                    (Marker::FileStart, Some(size)) => self.owed = size,
                    (Marker::FileData, _) => {
                        self.owed = self.owed.saturating_sub(payload.len() as u64)
                    }
                    _ => {}
                }
                Some(Ok(RawFrame::Block { marker, payload }))
            }
            Err(ProtocolError::Truncated { .. }) => None,
            Err(err) => {
                if marker == Marker::FileStart {
                    self.owed = 0;
                }
                self.resync();
                Some(Err(err))
            }
        }
    }

    /// Length of the next `FILE_DATA` payload, or `None` while it is incomplete.
    fn data_frame_len(&self, body: &[u8]) -> Option<usize> {
        if self.owed == 0 {
            // No announced transfer. The block ends at the next newline so the
            // lines behind it survive; without one it is the rest of the buffer.
            return Some(
                body.iter()
                    .position(|&byte| byte == b'\n')
                    .unwrap_or(body.len()),
            );
        }
        let expected = (self.chunk_size as u64).min(self.owed) as usize;
        (body.len() >= expected).then_some(expected)
    }

    fn resync(&mut self) {
        match self.buf.iter().position(|&byte| byte == b'\n') {
            Some(pos) => self.buf.advance(pos + 1),
            None => self.buf.clear(),
        }
    }
}
