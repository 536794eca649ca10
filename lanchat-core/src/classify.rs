use std::borrow::Cow;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Json,
    LegacyText,
    Binary,
}

/// A classified line, keeping the parse result so it is not done twice.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified<'a> {
    Json(Value),
    LegacyText(Cow<'a, str>),
    Binary,
}

impl Classified<'_> {
    pub fn kind(&self) -> FrameKind {
        match self {
            Classified::Json(_) => FrameKind::Json,
            Classified::LegacyText(_) => FrameKind::LegacyText,
            Classified::Binary => FrameKind::Binary,
        }
    }
}

pub fn classify(line: &[u8]) -> FrameKind {
    classify_line(line).kind()
}

pub fn classify_line(line: &[u8]) -> Classified<'_> {
    if is_binary(line) {
        return Classified::Binary;
    }

    // Only documents with an object or array at the top level count as JSON;
    // a bare number or string is ordinary chat text.
    match serde_json::from_slice::<Value>(line) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Classified::Json(value),
        _ => Classified::LegacyText(String::from_utf8_lossy(line)),
    }
}

/// Control bytes other than tab, LF and CR make up more than a tenth of the
/// line, or the line contains the `0x89 'P'` lead of a PNG signature.
pub fn is_binary(line: &[u8]) -> bool {
    if line.windows(2).any(|pair| pair[0] == 0x89 && pair[1] == b'P') {
        return true;
    }

    let non_printable = line
        .iter()
        .filter(|&&byte| byte < 32 && !matches!(byte, b'\t' | b'\n' | b'\r'))
        .count();
    non_printable * 10 > line.len()
}
