//! Whole-file transfers carried inside a single JSON line.

use bytes::Bytes;
use serde_json::{Map, Value, json};

use crate::{
    BROADCAST_TARGET, Base64Payload, CoreError, FileKind, FileTransfer, MAX_BASE64_FILE_BYTES,
    Session,
};

/// Builds a `file_base64` / `image_base64` line, newline included.
///
/// Nothing is returned unless the encoded payload decodes back to `data`, so a
/// failed encode never reaches the socket.
pub fn encode_file_message(
    session: &Session,
    filename: &str,
    kind: FileKind,
    data: &[u8],
) -> Result<String, CoreError> {
    let size = data.len() as u64;
    if size > MAX_BASE64_FILE_BYTES {
        return Err(CoreError::FileTooLarge {
            filename: filename.to_owned(),
            size,
            max: MAX_BASE64_FILE_BYTES,
        });
    }

    let encoded = Base64Payload::encode(data);
    let stripped: String = encoded
        .as_str()
        .chars()
        .filter(|ch| !matches!(ch, '\r' | '\n' | '\t'))
        .collect();
    let payload = Base64Payload::sanitize(&stripped);
    if payload.decode() != data {
        return Err(CoreError::EncodeFailure {
            filename: filename.to_owned(),
            reason: "base64 payload does not decode to the original bytes".to_owned(),
        });
    }

    let kind_tag = if kind == FileKind::Image {
        "image_base64"
    } else {
        "file_base64"
    };
    let mut message = json!({
        "type": kind_tag,
        "sender": session.username,
        "filename": filename,
        "filesize": size.to_string(),
        "filedata": payload.into_string(),
    });
    if let (Some(target), Value::Object(fields)) = (session.private_target(), &mut message) {
        fields.insert("target".to_owned(), Value::String(target.to_owned()));
    }

    let mut line = serde_json::to_string(&message)?;
    line.push('\n');
    Ok(line)
}

/// Reads a received `file_base64` / `image_base64` object.
pub(crate) fn decode_file_message(
    fields: &Map<String, Value>,
    is_image: bool,
) -> Result<FileTransfer, CoreError> {
    let text = |key: &str| fields.get(key).and_then(Value::as_str).unwrap_or_default();
    let filename = text("filename");

    let payload = Base64Payload::sanitize(text("filedata"));
    let data = payload.decode();
    if data.is_empty() {
        let reason = if payload.is_empty() {
            "no file data"
        } else {
            "invalid base64"
        };
        return Err(CoreError::DecodeFailure {
            filename: filename.to_owned(),
            reason: reason.to_owned(),
        });
    }

    let kind = if is_image {
        FileKind::Image
    } else {
        FileKind::from_path(filename)
    };
    let target = Some(text("target"))
        .filter(|target| !target.is_empty() && *target != BROADCAST_TARGET)
        .map(str::to_owned);

    Ok(FileTransfer::new(
        text("sender"),
        filename,
        kind,
        declared_size(fields.get("filesize")),
        Bytes::from(data),
    )
    .with_target(target))
}

/// `filesize` travels as a decimal string; garbage or negatives count as unknown.
fn declared_size(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::String(raw)) => raw.trim().parse().unwrap_or(0),
        Some(Value::Number(number)) => number.as_u64().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(line: &str) -> Map<String, Value> {
        match serde_json::from_str(line).expect("valid json") {
            Value::Object(fields) => fields,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn keys_are_sorted_and_size_is_a_string() {
        let session = Session::new("alice");
        let line = encode_file_message(&session, "a.txt", FileKind::Document, b"abc")
            .expect("encode");
        assert_eq!(
            line,
            "{\"filedata\":\"YWJj\",\"filename\":\"a.txt\",\"filesize\":\"3\",\"sender\":\"alice\",\"type\":\"file_base64\"}\n"
        );
    }

    #[test]
    fn private_target_is_included() {
        let mut session = Session::new("alice");
        session.set_target("bob");
        let line = encode_file_message(&session, "cat.png", FileKind::Image, &[1, 2, 3, 4])
            .expect("encode");
        let fields = object(line.trim_end());
        assert_eq!(fields["type"], "image_base64");
        assert_eq!(fields["target"], "bob");

        let file = decode_file_message(&fields, true).expect("decode");
        assert_eq!(file.data.as_ref(), &[1, 2, 3, 4]);
        assert_eq!(file.target.as_deref(), Some("bob"));
        assert!(file.is_image());
    }

    #[test]
    fn oversized_file_is_refused() {
        let session = Session::new("alice");
        let data = vec![0_u8; MAX_BASE64_FILE_BYTES as usize + 1];
        assert!(matches!(
            encode_file_message(&session, "big.bin", FileKind::Other, &data),
            Err(CoreError::FileTooLarge { .. })
        ));
    }

    #[test]
    fn decoded_length_wins_over_declared_size() {
        let fields = object(
            r#"{"type":"file_base64","sender":"bob","filename":"a.txt","filesize":"99","filedata":"YWJj"}"#,
        );
        let file = decode_file_message(&fields, false).expect("decode");
        assert_eq!(file.size, 3);
        assert_eq!(file.declared_size, 99);
        assert!(file.size_mismatch());
    }

    #[test]
    fn garbage_size_counts_as_unknown() {
        assert_eq!(declared_size(Some(&json!("12abc"))), 0);
        assert_eq!(declared_size(Some(&json!(" 42 "))), 42);
        assert_eq!(declared_size(Some(&json!(-3))), 0);
        assert_eq!(declared_size(None), 0);
    }

    #[test]
    fn invalid_base64_is_a_decode_failure() {
        let fields = object(r#"{"type":"file_base64","filename":"x","filedata":"@@@@"}"#);
        let err = decode_file_message(&fields, false).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Decode);
    }
}
