use thiserror::Error;

/// Malformed framing on the wire. The offending frame is dropped and the
/// reader resynchronises at the next newline or marker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated {field}: need {needed} bytes, have {available}")]
    Truncated {
        field: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("negative length {value} in {field}")]
    NegativeLength { field: &'static str, value: i64 },
    #[error("{field} length {value} exceeds limit {max}")]
    LengthOverLimit {
        field: &'static str,
        value: u64,
        max: u64,
    },
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
    #[error("FILE_DATA frame of {len} bytes without an announced transfer")]
    DataWithoutHeader { len: usize },
    #[error("transfer of {filename} interrupted after {received}/{total} bytes by a new header")]
    InterleavedTransfer {
        filename: String,
        received: u64,
        total: u64,
    },
    #[error("line exceeds {max} bytes without a terminator")]
    LineTooLong { max: usize },
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("failed to decode {filename}: {reason}")]
    DecodeFailure { filename: String, reason: String },
    #[error("failed to encode {filename}: {reason}")]
    EncodeFailure { filename: String, reason: String },
    #[error("{filename} is {size} bytes; limit is {max} bytes")]
    FileTooLarge {
        filename: String,
        size: u64,
        max: u64,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Decode,
    Encode,
    Transport,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Protocol(_) => ErrorKind::Protocol,
            CoreError::DecodeFailure { .. } => ErrorKind::Decode,
            // Local file problems surface while preparing an upload, never on the socket.
            CoreError::EncodeFailure { .. }
            | CoreError::FileTooLarge { .. }
            | CoreError::Serialization(_)
            | CoreError::Io(_) => ErrorKind::Encode,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let protocol = CoreError::from(ProtocolError::DataWithoutHeader { len: 4 });
        assert_eq!(protocol.kind(), ErrorKind::Protocol);

        let decode = CoreError::DecodeFailure {
            filename: "a.txt".to_owned(),
            reason: "invalid base64".to_owned(),
        };
        assert_eq!(decode.kind(), ErrorKind::Decode);

        let io = CoreError::from(std::io::Error::other("gone"));
        assert_eq!(io.kind(), ErrorKind::Encode);
    }
}
