use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// A sanitised base64 string: no whitespace, length a multiple of four.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Base64Payload(String);

impl Base64Payload {
    /// Strips all whitespace and pads with `=` up to a multiple of four.
    pub fn sanitize(raw: &str) -> Self {
        let mut cleaned: String = raw.chars().filter(|ch| !ch.is_whitespace()).collect();
        while cleaned.len() % 4 != 0 {
            cleaned.push('=');
        }
        Self(cleaned)
    }

    pub fn encode(data: &[u8]) -> Self {
        Self::sanitize(&STANDARD.encode(data))
    }

    /// Never fails: anything that is not valid base64 yields an empty vector,
    /// which callers report as a decode failure.
    pub fn decode(&self) -> Vec<u8> {
        STANDARD.decode(self.0.as_bytes()).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_removed_before_padding() {
        let payload = Base64Payload::sanitize("YW\r\nJj\t ");
        assert_eq!(payload.as_str(), "YWJj");
        assert_eq!(payload.decode(), b"abc");
    }

    #[test]
    fn short_input_is_padded_to_multiple_of_four() {
        let seven = Base64Payload::sanitize("YWJjZGU");
        assert_eq!(seven.as_str(), "YWJjZGU=");
        assert_eq!(seven.decode(), b"abcde");

        let five = Base64Payload::sanitize("YWJjZ");
        assert_eq!(five.as_str(), "YWJjZ===");
        assert_eq!(five.len() % 4, 0);
    }

    #[test]
    fn invalid_input_decodes_to_empty() {
        assert!(Base64Payload::sanitize("@@@@").decode().is_empty());
        assert!(Base64Payload::sanitize("").decode().is_empty());
        // A single dangling sextet cannot encode a byte.
        assert!(Base64Payload::sanitize("YWJjZ").decode().is_empty());
    }
}
