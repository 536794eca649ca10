use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::{FileKind, FileTransfer, ProtocolError};

use super::header::{FileHeader, ImageMessage};

/// Where the receiving side of a chunked transfer stands. Completion is not a
/// resting state: the finished file is handed out and the assembly goes back
/// to `Idle` in the same step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    Idle,
    HeaderReceived,
    Accumulating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyStep {
    Started {
        filename: String,
        total: u64,
    },
    Progress {
        filename: String,
        received: u64,
        total: u64,
    },
    Complete(FileTransfer),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderOutcome {
    /// Set when the header cut off an assembly that had not finished yet.
    pub interrupted: Option<ProtocolError>,
    pub step: AssemblyStep,
}

#[derive(Debug)]
struct Pending {
    header: FileHeader,
    buf: BytesMut,
}

/// Single-flight receiver for `FILE_START` / `FILE_DATA` transfers.
#[derive(Debug, Default)]
pub struct InboundAssembly {
    current: Option<Pending>,
}

impl InboundAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AssemblyState {
        match &self.current {
            None => AssemblyState::Idle,
            Some(pending) if pending.buf.is_empty() => AssemblyState::HeaderReceived,
            Some(_) => AssemblyState::Accumulating,
        }
    }

    pub fn on_header(&mut self, payload: &[u8]) -> Result<HeaderOutcome, ProtocolError> {
        let parsed = FileHeader::parse(payload);
        let interrupted = self.current.take().map(|old| {
            warn!(
                filename = %old.header.filename,
                received = old.buf.len(),
                total = old.header.file_size,
                "incomplete transfer discarded by a new header"
            );
            ProtocolError::InterleavedTransfer {
                filename: old.header.filename,
                received: old.buf.len() as u64,
                total: old.header.file_size,
            }
        });
        let header = parsed?;

        debug!(filename = %header.filename, total = header.file_size, "file header received");
        if header.file_size == 0 {
            let transfer = FileTransfer::new("", header.filename, header.kind, 0, Bytes::new());
            return Ok(HeaderOutcome {
                interrupted,
                step: AssemblyStep::Complete(transfer),
            });
        }

        let step = AssemblyStep::Started {
            filename: header.filename.clone(),
            total: header.file_size,
        };
        let capacity = usize::try_from(header.file_size).unwrap_or(usize::MAX);
        self.current = Some(Pending {
            buf: BytesMut::with_capacity(capacity),
            header,
        });
        Ok(HeaderOutcome { interrupted, step })
    }

    /// Appends one data block. Bytes beyond the announced size are ignored.
    pub fn on_data(&mut self, payload: &[u8]) -> Result<AssemblyStep, ProtocolError> {
        let Some(pending) = self.current.as_mut() else {
            return Err(ProtocolError::DataWithoutHeader { len: payload.len() });
        };

        let total = pending.header.file_size;
        let owed = total.saturating_sub(pending.buf.len() as u64);
        let take = payload.len().min(usize::try_from(owed).unwrap_or(usize::MAX));
        pending.buf.extend_from_slice(&payload[..take]);

        let received = pending.buf.len() as u64;
        if received < total {
            return Ok(AssemblyStep::Progress {
                filename: pending.header.filename.clone(),
                received,
                total,
            });
        }

        let Some(Pending { header, buf }) = self.current.take() else {
            return Err(ProtocolError::DataWithoutHeader { len: payload.len() });
        };
        Ok(AssemblyStep::Complete(FileTransfer::new(
            "",
            header.filename,
            header.kind,
            header.file_size,
            buf.freeze(),
        )))
    }

    /// Decodes a self-contained `IMAGE_MSG` block. It never touches the
    /// chunked assembly.
    pub fn on_image(&self, payload: &[u8]) -> Result<FileTransfer, ProtocolError> {
        let image = ImageMessage::parse(payload)?;
        let declared = image.data.len() as u64;
        Ok(FileTransfer::new(
            image.sender,
            image.filename,
            FileKind::Image,
            declared,
            image.data,
        ))
    }

    /// Fraction received, `0.0` when idle or when the file is empty.
    pub fn progress(&self) -> f64 {
        match &self.current {
            Some(pending) if pending.header.file_size > 0 => {
                pending.buf.len() as f64 / pending.header.file_size as f64
            }
            _ => 0.0,
        }
    }

    /// Drops the assembly without producing a file. Returns the abandoned
    /// filename, if there was one.
    pub fn abort(&mut self) -> Option<String> {
        self.current.take().map(|pending| pending.header.filename)
    }
}
