use std::path::PathBuf;

use lanchat_core::{FileEncoding, FileTransfer, Message};

use crate::TransportError;

/// Requests from the UI side to the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Something the user typed: chat text or a `/command`.
    SendText(String),
    SetTarget(String),
    RequestUsers,
    SendFile {
        path: PathBuf,
        encoding: FileEncoding,
    },
    CancelUpload,
    Disconnect,
}

#[derive(Debug)]
pub enum ClientEvent {
    Connecting {
        server: String,
    },
    Connected,
    Disconnected {
        reason: Option<String>,
    },
    TransportError(TransportError),
    Message(Message),
    FileReceived {
        message: FileTransfer,
        path: PathBuf,
    },
    ReceiveProgress {
        filename: String,
        received: u64,
        total: u64,
    },
    /// Recoverable problems worth showing to the user: bad frames, undecodable
    /// files, failed saves.
    Notice(String),
    Renamed {
        username: String,
    },
    UploadQueued {
        filename: String,
        position: usize,
    },
    UploadStarted {
        filename: String,
        total: u64,
    },
    UploadProgress {
        filename: String,
        written: u64,
        total: u64,
    },
    UploadFinished {
        filename: String,
    },
    UploadFailed {
        filename: String,
        reason: String,
    },
}
