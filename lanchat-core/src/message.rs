use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::FileKind;

/// One row of a `user_list`. Field order matches the compact, key-sorted
/// JSON the peers exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UserEntry {
    pub is_self: bool,
    pub online: bool,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub sender: String,
    pub filename: String,
    /// Decoded length; always `data.len()`.
    pub size: u64,
    /// Size announced by the sender, `0` when unknown.
    pub declared_size: u64,
    pub data: Bytes,
    pub kind: FileKind,
    pub target: Option<String>,
}

impl FileTransfer {
    /// The decoded bytes are authoritative. A disagreeing declared size is
    /// logged and kept for inspection, never used to reject the file.
    pub fn new(
        sender: impl Into<String>,
        filename: impl Into<String>,
        kind: FileKind,
        declared_size: u64,
        data: Bytes,
    ) -> Self {
        let transfer = Self {
            sender: sender.into(),
            filename: filename.into(),
            size: data.len() as u64,
            declared_size,
            data,
            kind,
            target: None,
        };
        if transfer.size_mismatch() {
            warn!(
                filename = %transfer.filename,
                declared = transfer.declared_size,
                actual = transfer.size,
                "file size mismatch, using decoded length"
            );
        }
        transfer
    }

    #[must_use]
    pub fn with_target(mut self, target: Option<String>) -> Self {
        self.target = target;
        self
    }

    pub fn is_image(&self) -> bool {
        self.kind == FileKind::Image
    }

    pub fn size_mismatch(&self) -> bool {
        self.declared_size > 0 && self.declared_size != self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text {
        sender: String,
        content: String,
    },
    Private {
        sender: String,
        target: String,
        content: String,
    },
    UserStatus {
        username: String,
        online: bool,
    },
    UserList {
        entries: Vec<UserEntry>,
    },
    Error {
        text: String,
    },
    System {
        text: String,
    },
    FileTransfer(FileTransfer),
}
