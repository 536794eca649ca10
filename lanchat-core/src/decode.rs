use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    Classified, CoreError, Message, Session, UserEntry, classify_line,
    transfer::decode_file_message,
};

const ONLINE_USERS: &str = "在线用户";

static CHAT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(\d{1,2}:\d{2})\] (.+?): (.+)").expect("chat line pattern is valid")
});

/// Runs one line through the classifier and the matching decoder. Binary lines
/// and JSON of an unknown type yield `Ok(None)`.
pub fn decode_line(line: &[u8], session: &Session) -> Result<Option<Message>, CoreError> {
    match classify_line(line) {
        Classified::Binary => {
            debug!(len = line.len(), "dropping binary line");
            Ok(None)
        }
        Classified::Json(value) => decode_json(&value, session),
        Classified::LegacyText(text) => Ok(decode_legacy(&text, session)),
    }
}

pub fn decode_json(value: &Value, session: &Session) -> Result<Option<Message>, CoreError> {
    let Some(fields) = value.as_object() else {
        return Ok(None);
    };
    let Some(kind) = fields.get("type").and_then(Value::as_str) else {
        return Ok(None);
    };

    let message = match kind {
        "text" => {
            let sender = str_field(fields, "sender");
            let content = str_field(fields, "content");
            if bool_field(fields, "isPrivate") {
                let target = match str_field(fields, "target") {
                    target if target.is_empty() => session.username.clone(),
                    target => target,
                };
                Message::Private {
                    sender,
                    target,
                    content,
                }
            } else {
                Message::Text { sender, content }
            }
        }
        "private" => Message::Private {
            sender: str_field(fields, "sender"),
            target: str_field(fields, "target"),
            content: str_field(fields, "content"),
        },
        "user_status" => Message::UserStatus {
            username: str_field(fields, "username"),
            online: bool_field(fields, "online"),
        },
        "user_list" => Message::UserList {
            entries: user_entries(fields.get("users"), session),
        },
        "error" => Message::Error {
            text: str_field(fields, "message"),
        },
        "file_base64" => Message::FileTransfer(decode_file_message(fields, false)?),
        "image_base64" => Message::FileTransfer(decode_file_message(fields, true)?),
        other => {
            debug!(kind = other, "ignoring message of unknown type");
            return Ok(None);
        }
    };
    Ok(Some(message))
}

/// Plain-text lines from older servers. Anything that matches no grammar is
/// kept as a system notice; only empty lines are dropped.
pub fn decode_legacy(line: &str, session: &Session) -> Option<Message> {
    if line.is_empty() {
        return None;
    }

    if line.starts_with("[系统]") || line.starts_with("[System]") {
        let text = line
            .split_once(']')
            .map_or(line, |(_, rest)| rest)
            .trim()
            .to_owned();
        return Some(Message::System { text });
    }

    if let Some(users) = legacy_user_list(line) {
        let entries = users
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| UserEntry {
                is_self: session.is_self(name),
                online: true,
                username: name.to_owned(),
            })
            .collect();
        return Some(Message::UserList { entries });
    }

    if let Some(captures) = CHAT_LINE.captures(line) {
        return Some(Message::Text {
            sender: captures[2].to_owned(),
            content: captures[3].to_owned(),
        });
    }

    Some(Message::System {
        text: line.to_owned(),
    })
}

fn legacy_user_list(line: &str) -> Option<&str> {
    let start = line.find(ONLINE_USERS)? + ONLINE_USERS.len();
    line[start..].split_once(':').map(|(_, users)| users)
}

fn user_entries(value: Option<&Value>, session: &Session) -> Vec<UserEntry> {
    let Some(Value::Array(users)) = value else {
        return Vec::new();
    };
    users
        .iter()
        .filter_map(|user| serde_json::from_value::<UserEntry>(user.clone()).ok())
        .filter(|entry| !entry.username.is_empty())
        .map(|mut entry| {
            entry.is_self |= session.is_self(&entry.username);
            entry
        })
        .collect()
}

fn str_field(fields: &Map<String, Value>, key: &str) -> String {
    fields
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

fn bool_field(fields: &Map<String, Value>, key: &str) -> bool {
    fields.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("alice")
    }

    fn json(line: &str) -> Option<Message> {
        decode_line(line.as_bytes(), &session()).expect("decodes")
    }

    #[test]
    fn timestamped_chat_line() {
        assert_eq!(
            decode_legacy("[14:05] alice: hello", &session()),
            Some(Message::Text {
                sender: "alice".to_owned(),
                content: "hello".to_owned(),
            })
        );
    }

    #[test]
    fn system_prefix_is_stripped() {
        assert_eq!(
            decode_legacy("[系统] bob 加入了聊天室", &session()),
            Some(Message::System {
                text: "bob 加入了聊天室".to_owned()
            })
        );
        assert_eq!(
            decode_legacy("[System]  welcome ", &session()),
            Some(Message::System {
                text: "welcome".to_owned()
            })
        );
    }

    #[test]
    fn legacy_user_list_marks_self() {
        let Some(Message::UserList { entries }) =
            decode_legacy("在线用户: alice, bob,, carol ", &session())
        else {
            panic!("expected a user list");
        };
        let names: Vec<_> = entries.iter().map(|e| e.username.as_str()).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
        assert!(entries[0].is_self);
        assert!(!entries[1].is_self);
    }

    #[test]
    fn unmatched_text_falls_back_to_notice() {
        assert_eq!(
            decode_legacy("server restarting", &session()),
            Some(Message::System {
                text: "server restarting".to_owned()
            })
        );
        assert_eq!(decode_legacy("", &session()), None);
    }

    #[test]
    fn json_text_and_private_flag() {
        assert_eq!(
            json(r#"{"type":"text","sender":"bob","content":"hi","timestamp":"x"}"#),
            Some(Message::Text {
                sender: "bob".to_owned(),
                content: "hi".to_owned(),
            })
        );
        assert_eq!(
            json(r#"{"type":"text","sender":"bob","content":"psst","isPrivate":true}"#),
            Some(Message::Private {
                sender: "bob".to_owned(),
                target: "alice".to_owned(),
                content: "psst".to_owned(),
            })
        );
    }

    #[test]
    fn user_list_and_status() {
        let line = r#"{"type":"user_list","users":[{"username":"alice","online":true,"isSelf":false},{"username":"bob","online":false,"isSelf":false}]}"#;
        let Some(Message::UserList { entries }) = json(line) else {
            panic!("expected a user list");
        };
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_self);
        assert!(!entries[1].online);

        assert_eq!(
            json(r#"{"type":"user_status","username":"bob","online":true}"#),
            Some(Message::UserStatus {
                username: "bob".to_owned(),
                online: true,
            })
        );
    }

    #[test]
    fn error_message_and_unknown_type() {
        assert_eq!(
            json(r#"{"type":"error","message":"用户 bob 不在线"}"#),
            Some(Message::Error {
                text: "用户 bob 不在线".to_owned()
            })
        );
        assert_eq!(json(r#"{"type":"typing","sender":"bob"}"#), None);
        assert_eq!(json(r#"{"sender":"bob"}"#), None);
    }

    #[test]
    fn base64_file_message() {
        let Some(Message::FileTransfer(file)) = json(
            r#"{"type":"file_base64","filename":"a.txt","filesize":"3","filedata":"YWJj"}"#,
        ) else {
            panic!("expected a file");
        };
        assert_eq!(file.data.as_ref(), b"abc");
        assert_eq!(file.size, 3);
        assert!(!file.size_mismatch());
    }

    #[test]
    fn undecodable_file_is_an_error() {
        let err = decode_line(
            br#"{"type":"image_base64","filename":"x.png","filedata":"%%%%"}"#,
            &session(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::DecodeFailure { .. }));
    }
}
