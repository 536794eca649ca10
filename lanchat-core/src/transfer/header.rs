use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    CoreError, MAX_CHUNKED_FILE_BYTES, MAX_FILENAME_BYTES, ProtocolError, reader::Marker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Text = 0,
    Image = 1,
    Video = 2,
    Audio = 3,
    Document = 4,
    Other = 5,
}

impl FileKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => FileKind::Text,
            1 => FileKind::Image,
            2 => FileKind::Video,
            3 => FileKind::Audio,
            4 => FileKind::Document,
            _ => FileKind::Other,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let ext = path
            .as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("jpg" | "jpeg" | "png" | "bmp" | "gif" | "webp") => FileKind::Image,
            Some("mp4" | "avi" | "mkv" | "mov" | "wmv") => FileKind::Video,
            Some("mp3" | "wav" | "flac" | "ogg") => FileKind::Audio,
            Some("pdf" | "doc" | "docx" | "txt") => FileKind::Document,
            _ => FileKind::Other,
        }
    }
}

/// Bounds-checked big-endian field reader over a borrowed frame body.
struct Fields<'a> {
    buf: &'a [u8],
    consumed: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, consumed: 0 }
    }

    fn ensure(&self, field: &'static str, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Truncated {
                field,
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, ProtocolError> {
        self.ensure(field, 4)?;
        self.consumed += 4;
        Ok(self.buf.get_i32())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, ProtocolError> {
        self.ensure(field, 8)?;
        self.consumed += 8;
        Ok(self.buf.get_i64())
    }

    /// Reads an `int32` length and validates it before anything is allocated.
    fn len_prefix(&mut self, field: &'static str, max: usize) -> Result<usize, ProtocolError> {
        let value = self.i32(field)?;
        if value < 0 {
            return Err(ProtocolError::NegativeLength {
                field,
                value: i64::from(value),
            });
        }
        let len = value as usize;
        if len > max {
            return Err(ProtocolError::LengthOverLimit {
                field,
                value: len as u64,
                max: max as u64,
            });
        }
        Ok(len)
    }

    fn bytes(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.ensure(field, len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        self.consumed += len;
        Ok(head)
    }

    fn utf8(&mut self, field: &'static str, len: usize) -> Result<String, ProtocolError> {
        let raw = self.bytes(field, len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8 { field })
    }
}

/// Announces a chunked transfer: `int32 fileType | int32 nameLen | name | int64 fileSize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub kind: FileKind,
    pub filename: String,
    pub file_size: u64,
}

impl FileHeader {
    /// Parses a complete header payload (marker already stripped).
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        Self::parse_prefix(payload).map(|(header, _)| header)
    }

    /// Parses a header from the front of `body` and reports how many bytes it
    /// occupied. `Truncated` means the body is a valid prefix that needs more bytes.
    pub(crate) fn parse_prefix(body: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let mut fields = Fields::new(body);
        let kind = FileKind::from_code(fields.i32("file type")?);
        let name_len = fields.len_prefix("filename", MAX_FILENAME_BYTES)?;
        let filename = fields.utf8("filename", name_len)?;
        let file_size = fields.i64("file size")?;
        if file_size < 0 {
            return Err(ProtocolError::NegativeLength {
                field: "file size",
                value: file_size,
            });
        }
        let file_size = file_size as u64;
        if file_size > MAX_CHUNKED_FILE_BYTES {
            return Err(ProtocolError::LengthOverLimit {
                field: "file size",
                value: file_size,
                max: MAX_CHUNKED_FILE_BYTES,
            });
        }
        Ok((
            Self {
                kind,
                filename,
                file_size,
            },
            fields.consumed,
        ))
    }

    /// Full `FILE_START` frame, marker included.
    pub fn to_frame(&self) -> Result<Bytes, CoreError> {
        let name = self.filename.as_bytes();
        let name_len = i32::try_from(name.len()).map_err(|_| CoreError::EncodeFailure {
            filename: self.filename.clone(),
            reason: "filename too long".to_owned(),
        })?;
        let file_size = i64::try_from(self.file_size).map_err(|_| CoreError::FileTooLarge {
            filename: self.filename.clone(),
            size: self.file_size,
            max: MAX_CHUNKED_FILE_BYTES,
        })?;

        let marker = Marker::FileStart.as_bytes();
        let mut out = BytesMut::with_capacity(marker.len() + 4 + 4 + name.len() + 8);
        out.extend_from_slice(marker);
        out.put_i32(self.kind.code());
        out.put_i32(name_len);
        out.extend_from_slice(name);
        out.put_i64(file_size);
        Ok(out.freeze())
    }
}

/// `FILE_DATA` frame carrying one chunk.
pub fn data_frame(chunk: &[u8]) -> Bytes {
    let marker = Marker::FileData.as_bytes();
    let mut out = BytesMut::with_capacity(marker.len() + chunk.len());
    out.extend_from_slice(marker);
    out.extend_from_slice(chunk);
    out.freeze()
}

/// Self-contained image frame:
/// `int32 senderLen | sender | int32 imageLen | image | int32 nameLen | filename`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMessage {
    pub sender: String,
    pub data: Bytes,
    pub filename: String,
}

impl ImageMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        Self::parse_prefix(payload).map(|(image, _)| image)
    }

    pub(crate) fn parse_prefix(body: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let mut fields = Fields::new(body);
        let sender_len = fields.len_prefix("sender", MAX_FILENAME_BYTES)?;
        let sender = fields.utf8("sender", sender_len)?;
        let image_len = fields.len_prefix("image data", MAX_CHUNKED_FILE_BYTES as usize)?;
        let data = Bytes::copy_from_slice(fields.bytes("image data", image_len)?);
        let name_len = fields.len_prefix("filename", MAX_FILENAME_BYTES)?;
        let filename = fields.utf8("filename", name_len)?;
        Ok((
            Self {
                sender,
                data,
                filename,
            },
            fields.consumed,
        ))
    }

    pub fn to_frame(&self) -> Result<Bytes, CoreError> {
        let too_long = |what: &str| CoreError::EncodeFailure {
            filename: self.filename.clone(),
            reason: format!("{what} too long"),
        };
        let sender = self.sender.as_bytes();
        let name = self.filename.as_bytes();
        let sender_len = i32::try_from(sender.len()).map_err(|_| too_long("sender"))?;
        let image_len = i32::try_from(self.data.len()).map_err(|_| too_long("image"))?;
        let name_len = i32::try_from(name.len()).map_err(|_| too_long("filename"))?;

        let marker = Marker::ImageMsg.as_bytes();
        let mut out =
            BytesMut::with_capacity(marker.len() + 12 + sender.len() + self.data.len() + name.len());
        out.extend_from_slice(marker);
        out.put_i32(sender_len);
        out.extend_from_slice(sender);
        out.put_i32(image_len);
        out.extend_from_slice(&self.data);
        out.put_i32(name_len);
        out.extend_from_slice(name);
        Ok(out.freeze())
    }
}
