use tracing::{info, warn};

use crate::{
    AssemblyState, AssemblyStep, CoreError, FrameReader, InboundAssembly, Marker, Message,
    ProtocolError, RawFrame, Session, decode_line,
};

#[derive(Debug)]
pub enum InboundEvent {
    Message(Message),
    Progress {
        filename: String,
        received: u64,
        total: u64,
    },
    /// A recoverable problem with one frame; the stream carries on.
    Failure(CoreError),
}

/// Everything that happens to received bytes, run synchronously per delivery:
/// framing, classification, decoding and chunked reassembly.
#[derive(Debug, Default)]
pub struct InboundPipeline {
    reader: FrameReader,
    assembly: InboundAssembly,
}

impl InboundPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            reader: FrameReader::with_chunk_size(chunk_size),
            assembly: InboundAssembly::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8], session: &Session) -> Vec<InboundEvent> {
        self.reader.push(bytes);
        let mut events = Vec::new();
        for frame in self.reader.pull() {
            match frame {
                Ok(RawFrame::Line(line)) => match decode_line(&line, session) {
                    Ok(Some(message)) => events.push(InboundEvent::Message(message)),
                    Ok(None) => {}
                    Err(err) => {
                        warn!("dropping undecodable message: {}", err);
                        events.push(InboundEvent::Failure(err));
                    }
                },
                Ok(RawFrame::Block { marker, payload }) => {
                    self.on_block(marker, &payload, &mut events);
                }
                Err(err) => push_protocol_error(&mut events, err),
            }
        }
        events
    }

    /// Discards buffered bytes and any half-received file, as on disconnect.
    /// Returns the name of the abandoned file, if any.
    pub fn reset(&mut self) -> Option<String> {
        self.reader.reset();
        self.assembly.abort()
    }

    pub fn assembly_state(&self) -> AssemblyState {
        self.assembly.state()
    }

    pub fn assembly_progress(&self) -> f64 {
        self.assembly.progress()
    }

    fn on_block(&mut self, marker: Marker, payload: &[u8], events: &mut Vec<InboundEvent>) {
        match marker {
            Marker::FileStart => match self.assembly.on_header(payload) {
                Ok(outcome) => {
                    if let Some(err) = outcome.interrupted {
                        push_protocol_error(events, err);
                    }
                    push_step(events, outcome.step);
                }
                Err(err) => push_protocol_error(events, err),
            },
            Marker::FileData => match self.assembly.on_data(payload) {
                Ok(step) => push_step(events, step),
                Err(err) => push_protocol_error(events, err),
            },
            Marker::ImageMsg => match self.assembly.on_image(payload) {
                Ok(image) => events.push(InboundEvent::Message(Message::FileTransfer(image))),
                Err(err) => push_protocol_error(events, err),
            },
        }
    }
}

fn push_step(events: &mut Vec<InboundEvent>, step: AssemblyStep) {
    let event = match step {
        AssemblyStep::Started { filename, total } => {
            info!("receiving {} ({} bytes)", filename, total);
            InboundEvent::Progress {
                filename,
                received: 0,
                total,
            }
        }
        AssemblyStep::Progress {
            filename,
            received,
            total,
        } => InboundEvent::Progress {
            filename,
            received,
            total,
        },
        AssemblyStep::Complete(file) => {
            info!("received {} ({} bytes)", file.filename, file.size);
            InboundEvent::Message(Message::FileTransfer(file))
        }
    };
    events.push(event);
}

fn push_protocol_error(events: &mut Vec<InboundEvent>, err: ProtocolError) {
    warn!("protocol error: {}", err);
    events.push(InboundEvent::Failure(err.into()));
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::{
        CHUNK_SIZE, FileEncoding, FileHeader, FileKind, ImageMessage, OutboundFile, UploadQueue,
        UploadStep, data_frame,
    };

    fn header(name: &str, size: u64) -> Vec<u8> {
        FileHeader {
            kind: FileKind::Other,
            filename: name.to_owned(),
            file_size: size,
        }
        .to_frame()
        .expect("encode header")
        .to_vec()
    }

    fn files(events: &[InboundEvent]) -> Vec<&crate::FileTransfer> {
        events
            .iter()
            .filter_map(|event| match event {
                InboundEvent::Message(Message::FileTransfer(file)) => Some(file),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn text_and_file_share_the_stream() {
        let session = Session::new("alice");
        let mut wire = b"[12:00] bob: before\n".to_vec();
        wire.extend(header("data.bin", 5));
        wire.extend_from_slice(&data_frame(b"hell"));
        wire.extend_from_slice(&data_frame(b"o"));
        wire.extend_from_slice(b"[12:01] bob: after\n");

        let mut pipeline = InboundPipeline::with_chunk_size(4);
        let mut events = Vec::new();
        // Deliver in awkward 3-byte pieces.
        for piece in wire.chunks(3) {
            events.extend(pipeline.feed(piece, &session));
        }

        let received = files(&events);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].data.as_ref(), b"hello");

        let texts: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                InboundEvent::Message(Message::Text { content, .. }) => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, ["before", "after"]);
        assert_eq!(pipeline.assembly_state(), AssemblyState::Idle);
    }

    #[test]
    fn binary_lines_are_dropped_silently() {
        let session = Session::new("alice");
        let mut pipeline = InboundPipeline::default();
        let events = pipeline.feed(b"\x01\x02\x03\x04garbage\n", &session);
        assert!(events.is_empty());
    }

    #[test]
    fn file_larger_than_one_chunk_with_default_sizes() {
        let session = Session::new("alice");
        let payload: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 253) as u8).collect();
        let mut queue: UploadQueue<Cursor<Vec<u8>>> = UploadQueue::new();
        queue.enqueue(OutboundFile::from_reader(
            "big.bin",
            FileKind::Other,
            payload.len() as u64,
            FileEncoding::ChunkedBinary,
            Cursor::new(payload.clone()),
        ));

        let mut wire = Vec::new();
        while let Some(step) = queue.poll() {
            if let UploadStep::Frame { seq, frame, .. } = step {
                wire.extend_from_slice(&frame);
                queue.on_write_complete(seq);
            }
        }

        let mut pipeline = InboundPipeline::new();
        let mut events = Vec::new();
        for piece in wire.chunks(8_191) {
            events.extend(pipeline.feed(piece, &session));
        }
        assert!(
            !events.iter().any(|event| matches!(event, InboundEvent::Failure(_))),
            "unexpected failure in {events:?}"
        );
        let received = files(&events);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].data.as_ref(), payload.as_slice());
    }

    #[test]
    fn stray_data_frame_keeps_following_lines() {
        let session = Session::new("alice");
        let mut pipeline = InboundPipeline::new();
        let events = pipeline.feed(b"FILE_DATA\x00\x01tail\n[09:15] bob: hi\n[09:16] bob: again\n", &session);
        assert!(matches!(
            events.as_slice(),
            [
                InboundEvent::Failure(CoreError::Protocol(ProtocolError::DataWithoutHeader {
                    len: 6
                })),
                InboundEvent::Message(Message::Text { .. }),
                InboundEvent::Message(Message::Text { .. }),
            ]
        ));
    }

    #[test]
    fn stray_data_frame_is_a_protocol_failure() {
        let session = Session::new("alice");
        let mut pipeline = InboundPipeline::default();
        let events = pipeline.feed(b"FILE_DATAoops", &session);
        assert!(matches!(
            events.as_slice(),
            [InboundEvent::Failure(CoreError::Protocol(
                ProtocolError::DataWithoutHeader { len: 4 }
            ))]
        ));
    }

    #[test]
    fn image_frame_becomes_file_message() {
        let session = Session::new("alice");
        let frame = ImageMessage {
            sender: "bob".to_owned(),
            data: bytes::Bytes::from_static(b"img"),
            filename: "pic.png".to_owned(),
        }
        .to_frame()
        .expect("encode image");

        let mut pipeline = InboundPipeline::default();
        let events = pipeline.feed(&frame, &session);
        let received = files(&events);
        assert_eq!(received.len(), 1);
        assert!(received[0].is_image());
        assert_eq!(received[0].sender, "bob");
    }

    #[test]
    fn reset_discards_partial_file() {
        let session = Session::new("alice");
        let mut pipeline = InboundPipeline::with_chunk_size(4);
        let mut wire = header("half.bin", 8);
        wire.extend_from_slice(&data_frame(b"1234"));
        pipeline.feed(&wire, &session);
        assert_eq!(pipeline.assembly_state(), AssemblyState::Accumulating);

        assert_eq!(pipeline.reset().as_deref(), Some("half.bin"));
        assert_eq!(pipeline.assembly_state(), AssemblyState::Idle);
    }
}
