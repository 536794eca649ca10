mod classify;
mod decode;
mod error;
mod inbound;
mod message;
mod outbound;
mod payload;
mod reader;
mod session;
mod transfer;
mod upload;

pub use classify::{Classified, FrameKind, classify, classify_line, is_binary};
pub use decode::{decode_json, decode_legacy, decode_line};
pub use error::{CoreError, ErrorKind, ProtocolError};
pub use inbound::{InboundEvent, InboundPipeline};
pub use message::{FileTransfer, Message, UserEntry};
pub use outbound::{
    Composed, compose, format_timestamp, login_line, private_message, text_message,
    users_request,
};
pub use payload::Base64Payload;
pub use reader::{FrameReader, Marker, RawFrame};
pub use session::Session;
pub use transfer::{
    AssemblyState, AssemblyStep, FileHeader, FileKind, HeaderOutcome, ImageMessage,
    InboundAssembly, data_frame, encode_file_message,
};
pub use upload::{Enqueued, FileEncoding, OutboundFile, Progress, UploadQueue, UploadStep};

/// Fixed size of a `FILE_DATA` payload, except for the last frame of a file.
pub const CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_FILENAME_BYTES: usize = 4096;
pub const MAX_CHUNKED_FILE_BYTES: u64 = 50 * 1024 * 1024;
pub const MAX_BASE64_FILE_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;
/// Chat target meaning "everyone"; anything else selects a private conversation.
pub const BROADCAST_TARGET: &str = "所有人";
