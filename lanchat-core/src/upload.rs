//! Outbound files and the single-flight queue that paces chunked uploads.
//!
//! The queue never touches a socket. The connection polls it for the next
//! frame, writes that frame, and reports back with [`UploadQueue::on_write_complete`]
//! once the write has drained. Until then `poll` returns nothing, so at most
//! one chunk is ever buffered on the outbound side.

use std::{
    collections::VecDeque,
    fs::File,
    io::{self, Read},
    path::Path,
};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    CHUNK_SIZE, CoreError, FileHeader, FileKind, MAX_BASE64_FILE_BYTES, MAX_CHUNKED_FILE_BYTES,
    Marker, Session, data_frame, encode_file_message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEncoding {
    Base64Embedded,
    ChunkedBinary,
}

impl FileEncoding {
    pub fn max_size(self) -> u64 {
        match self {
            FileEncoding::Base64Embedded => MAX_BASE64_FILE_BYTES,
            FileEncoding::ChunkedBinary => MAX_CHUNKED_FILE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub bytes_written: u64,
    pub bytes_total: u64,
}

#[derive(Debug)]
pub struct OutboundFile<R = File> {
    pub filename: String,
    pub kind: FileKind,
    pub declared_size: u64,
    pub encoding: FileEncoding,
    reader: R,
    bytes_written: u64,
}

impl OutboundFile<File> {
    /// Opens `path` and checks it against the limit for `encoding`.
    pub fn open(path: impl AsRef<Path>, encoding: FileEncoding) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let unreadable = |err: io::Error| CoreError::EncodeFailure {
            filename: filename.clone(),
            reason: err.to_string(),
        };

        let file = File::open(path).map_err(unreadable)?;
        let size = file.metadata().map_err(unreadable)?.len();
        if size > encoding.max_size() {
            return Err(CoreError::FileTooLarge {
                filename,
                size,
                max: encoding.max_size(),
            });
        }

        let kind = FileKind::from_path(path);
        Ok(Self::from_reader(filename, kind, size, encoding, file))
    }
}

impl<R: Read> OutboundFile<R> {
    pub fn from_reader(
        filename: impl Into<String>,
        kind: FileKind,
        declared_size: u64,
        encoding: FileEncoding,
        reader: R,
    ) -> Self {
        Self {
            filename: filename.into(),
            kind,
            declared_size,
            encoding,
            reader,
            bytes_written: 0,
        }
    }

    pub fn progress(&self) -> Progress {
        Progress {
            bytes_written: self.bytes_written,
            bytes_total: self.declared_size,
        }
    }

    /// Reads the whole file and wraps it in one `file_base64`/`image_base64` line.
    pub fn into_base64_line(mut self, session: &Session) -> Result<String, CoreError> {
        let mut data = Vec::new();
        self.reader
            .read_to_end(&mut data)
            .map_err(|err| CoreError::EncodeFailure {
                filename: self.filename.clone(),
                reason: err.to_string(),
            })?;
        encode_file_message(session, &self.filename, self.kind, &data)
    }

    fn header_frame(&self) -> Result<Bytes, CoreError> {
        FileHeader {
            kind: self.kind,
            filename: self.filename.clone(),
            file_size: self.declared_size,
        }
        .to_frame()
    }

    /// Next `FILE_DATA` frame, or `None` once the declared size has been read.
    /// Every frame but the last is exactly `chunk_size` bytes, which is what
    /// lets the receiver delimit them.
    fn read_chunk(&mut self, chunk_size: usize) -> Result<Option<Bytes>, CoreError> {
        let remaining = self.declared_size.saturating_sub(self.bytes_written);
        if remaining == 0 {
            return Ok(None);
        }

        let want = remaining.min(chunk_size as u64);
        let mut chunk = Vec::with_capacity(want as usize);
        (&mut self.reader)
            .take(want)
            .read_to_end(&mut chunk)
            .map_err(|err| CoreError::EncodeFailure {
                filename: self.filename.clone(),
                reason: err.to_string(),
            })?;
        if (chunk.len() as u64) < want {
            return Err(CoreError::EncodeFailure {
                filename: self.filename.clone(),
                reason: format!(
                    "file ended after {} of {} bytes",
                    self.bytes_written + chunk.len() as u64,
                    self.declared_size
                ),
            });
        }
        Ok(Some(data_frame(&chunk)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Nothing else was waiting; the file goes out on the next poll.
    Started,
    /// 1-based position among the waiting files.
    Queued { position: usize },
}

#[derive(Debug)]
pub enum UploadStep {
    Started {
        filename: String,
        total: u64,
    },
    /// Write `frame` to the socket, then acknowledge `seq`.
    Frame {
        seq: u64,
        filename: String,
        frame: Bytes,
    },
    Finished {
        filename: String,
    },
    Failed {
        filename: String,
        error: CoreError,
    },
}

#[derive(Debug)]
struct InFlight {
    seq: u64,
    data_len: u64,
}

#[derive(Debug)]
struct Active<R> {
    file: OutboundFile<R>,
    header_sent: bool,
    in_flight: Option<InFlight>,
}

#[derive(Debug)]
pub struct UploadQueue<R = File> {
    chunk_size: usize,
    pending: VecDeque<OutboundFile<R>>,
    current: Option<Active<R>>,
    next_seq: u64,
}

impl<R: Read> Default for UploadQueue<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Read> UploadQueue<R> {
    /// Data frames are cut at [`CHUNK_SIZE`]; receivers rely on that size.
    pub fn new() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            pending: VecDeque::new(),
            current: None,
            next_seq: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            ..Self::new()
        }
    }

    pub fn enqueue(&mut self, file: OutboundFile<R>) -> Enqueued {
        let idle = self.is_idle();
        debug!(filename = %file.filename, size = file.declared_size, "upload enqueued");
        self.pending.push_back(file);
        if idle {
            Enqueued::Started
        } else {
            Enqueued::Queued {
                position: self.pending.len(),
            }
        }
    }

    /// Advances the active upload by one step. Returns `None` while a frame is
    /// still being written, or when there is nothing left to send.
    pub fn poll(&mut self) -> Option<UploadStep> {
        let Some(active) = self.current.as_mut() else {
            let file = self.pending.pop_front()?;
            info!("starting upload of {} ({} bytes)", file.filename, file.declared_size);
            let step = UploadStep::Started {
                filename: file.filename.clone(),
                total: file.declared_size,
            };
            self.current = Some(Active {
                file,
                header_sent: false,
                in_flight: None,
            });
            return Some(step);
        };

        if active.in_flight.is_some() {
            return None;
        }

        let next = if active.header_sent {
            active.file.read_chunk(self.chunk_size)
        } else {
            active.file.header_frame().map(Some)
        };

        match next {
            Ok(Some(frame)) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let data_len = if active.header_sent {
                    (frame.len() - Marker::FileData.as_bytes().len()) as u64
                } else {
                    0
                };
                active.header_sent = true;
                active.in_flight = Some(InFlight { seq, data_len });
                Some(UploadStep::Frame {
                    seq,
                    filename: active.file.filename.clone(),
                    frame,
                })
            }
            Ok(None) => {
                let filename = self.current.take()?.file.filename;
                info!("upload of {} finished", filename);
                Some(UploadStep::Finished { filename })
            }
            Err(error) => {
                let filename = self.current.take()?.file.filename;
                warn!("upload of {} failed: {}", filename, error);
                Some(UploadStep::Failed { filename, error })
            }
        }
    }

    /// Marks frame `seq` as drained. Returns the updated progress of the
    /// active upload; stale acknowledgements are ignored.
    pub fn on_write_complete(&mut self, seq: u64) -> Option<(String, Progress)> {
        let active = self.current.as_mut()?;
        let in_flight = active.in_flight.take_if(|in_flight| in_flight.seq == seq)?;
        active.file.bytes_written += in_flight.data_len;
        Some((active.file.filename.clone(), active.file.progress()))
    }

    /// A failed write ends that upload; the next poll moves on to the queue.
    pub fn on_write_failed(&mut self, seq: u64, err: io::Error) -> Option<UploadStep> {
        let matches = self
            .current
            .as_ref()
            .and_then(|active| active.in_flight.as_ref())
            .is_some_and(|in_flight| in_flight.seq == seq);
        if !matches {
            return None;
        }
        let filename = self.current.take()?.file.filename;
        warn!("upload of {} failed while writing: {}", filename, err);
        Some(UploadStep::Failed {
            filename,
            error: CoreError::Io(err),
        })
    }

    /// Drops the active upload and closes its file.
    pub fn cancel_current(&mut self) -> Option<String> {
        let filename = self.current.take()?.file.filename;
        info!("upload of {} cancelled", filename);
        Some(filename)
    }

    /// Drops everything, active and waiting. Returns the affected filenames.
    pub fn clear(&mut self) -> Vec<String> {
        self.current
            .take()
            .map(|active| active.file)
            .into_iter()
            .chain(self.pending.drain(..))
            .map(|file| file.filename)
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn current_progress(&self) -> Option<(&str, Progress)> {
        self.current
            .as_ref()
            .map(|active| (active.file.filename.as_str(), active.file.progress()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::{InboundEvent, InboundPipeline, Message};

    fn file(name: &str, len: usize) -> OutboundFile<Cursor<Vec<u8>>> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        OutboundFile::from_reader(
            name,
            FileKind::Other,
            len as u64,
            FileEncoding::ChunkedBinary,
            Cursor::new(data),
        )
    }

    /// Runs the queue to completion, acknowledging every frame at once.
    fn drain(queue: &mut UploadQueue<Cursor<Vec<u8>>>) -> (Vec<UploadStep>, Vec<u8>) {
        let mut steps = Vec::new();
        let mut wire = Vec::new();
        while let Some(step) = queue.poll() {
            if let UploadStep::Frame { seq, frame, .. } = &step {
                wire.extend_from_slice(frame);
                queue.on_write_complete(*seq).expect("ack matches");
            }
            steps.push(step);
        }
        (steps, wire)
    }

    #[test]
    fn three_uploads_go_out_in_order_without_interleaving() {
        let mut queue = UploadQueue::with_chunk_size(20);
        assert_eq!(queue.enqueue(file("a.bin", 45)), Enqueued::Started);
        assert_eq!(queue.enqueue(file("b.bin", 20)), Enqueued::Queued { position: 2 });
        assert_eq!(queue.enqueue(file("c.bin", 7)), Enqueued::Queued { position: 3 });

        let (steps, wire) = drain(&mut queue);
        assert!(queue.is_idle());

        let mut order = Vec::new();
        let mut active: Option<String> = None;
        for step in &steps {
            match step {
                UploadStep::Started { filename, .. } => {
                    assert!(active.is_none(), "{filename} started while another was active");
                    active = Some(filename.clone());
                    order.push(filename.clone());
                }
                UploadStep::Frame { filename, .. } => {
                    assert_eq!(active.as_ref(), Some(filename));
                }
                UploadStep::Finished { filename } => {
                    assert_eq!(active.take().as_ref(), Some(filename));
                }
                UploadStep::Failed { filename, error } => panic!("{filename} failed: {error}"),
            }
        }
        assert_eq!(order, ["a.bin", "b.bin", "c.bin"]);

        let frame_sizes: Vec<usize> = steps
            .iter()
            .filter_map(|step| match step {
                UploadStep::Frame { frame, .. } if frame.starts_with(Marker::FileData.as_bytes()) => {
                    Some(frame.len() - Marker::FileData.as_bytes().len())
                }
                _ => None,
            })
            .collect();
        assert_eq!(frame_sizes, [20, 20, 5, 20, 7]);

        let session = Session::new("reader");
        let mut pipeline = InboundPipeline::with_chunk_size(20);
        let received: Vec<(String, usize)> = pipeline
            .feed(&wire, &session)
            .into_iter()
            .filter_map(|event| match event {
                InboundEvent::Message(Message::FileTransfer(file)) => {
                    Some((file.filename, file.data.len()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            received,
            [
                ("a.bin".to_owned(), 45),
                ("b.bin".to_owned(), 20),
                ("c.bin".to_owned(), 7)
            ]
        );
    }

    #[test]
    fn next_chunk_waits_for_write_completion() {
        let mut queue = UploadQueue::with_chunk_size(4);
        queue.enqueue(file("x", 10));
        assert!(matches!(queue.poll(), Some(UploadStep::Started { .. })));

        let Some(UploadStep::Frame { seq, .. }) = queue.poll() else {
            panic!("expected the header frame");
        };
        assert!(queue.poll().is_none());
        assert!(queue.on_write_complete(seq + 7).is_none());

        let (_, progress) = queue.on_write_complete(seq).expect("header drained");
        assert_eq!(progress.bytes_written, 0);

        let Some(UploadStep::Frame { seq, .. }) = queue.poll() else {
            panic!("expected a data frame");
        };
        let (_, progress) = queue.on_write_complete(seq).expect("chunk drained");
        assert_eq!(
            progress,
            Progress {
                bytes_written: 4,
                bytes_total: 10,
            }
        );
    }

    #[test]
    fn failed_write_moves_on_to_next_file() {
        let mut queue = UploadQueue::with_chunk_size(8);
        queue.enqueue(file("broken", 16));
        queue.enqueue(file("fine", 3));
        queue.poll();
        let Some(UploadStep::Frame { seq, .. }) = queue.poll() else {
            panic!("expected the header frame");
        };

        let failed = queue.on_write_failed(seq, io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(failed, Some(UploadStep::Failed { ref filename, .. }) if filename == "broken"));

        let (steps, _) = drain(&mut queue);
        assert!(matches!(&steps[0], UploadStep::Started { filename, .. } if filename == "fine"));
        assert!(matches!(steps.last(), Some(UploadStep::Finished { filename }) if filename == "fine"));
    }

    #[test]
    fn short_file_fails_instead_of_desynchronising() {
        let mut queue = UploadQueue::with_chunk_size(8);
        queue.enqueue(OutboundFile::from_reader(
            "shrunk",
            FileKind::Other,
            12,
            FileEncoding::ChunkedBinary,
            Cursor::new(vec![1_u8; 5]),
        ));
        let (steps, _) = drain(&mut queue);
        let Some(UploadStep::Failed { error, .. }) = steps.last() else {
            panic!("expected a failure");
        };
        assert!(error.to_string().contains("file ended after 5 of 12 bytes"));
    }

    #[test]
    fn cancel_and_clear() {
        let mut queue = UploadQueue::with_chunk_size(8);
        queue.enqueue(file("one", 30));
        queue.enqueue(file("two", 30));
        queue.enqueue(file("three", 30));
        queue.poll();
        assert_eq!(queue.cancel_current().as_deref(), Some("one"));
        assert_eq!(queue.pending_len(), 2);

        assert!(matches!(queue.poll(), Some(UploadStep::Started { ref filename, .. }) if filename == "two"));
        assert_eq!(queue.clear(), ["two", "three"]);
        assert!(queue.is_idle());
    }

    #[test]
    fn base64_line_from_reader() {
        let session = Session::new("alice");
        let line = OutboundFile::from_reader(
            "a.txt",
            FileKind::Document,
            3,
            FileEncoding::Base64Embedded,
            Cursor::new(b"abc".to_vec()),
        )
        .into_base64_line(&session)
        .expect("encode");
        assert!(line.contains("\"filedata\":\"YWJj\""));
        assert!(line.ends_with('\n'));
    }
}
