use chrono::NaiveDateTime;
use serde_json::json;

use crate::{CoreError, Session};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A line ready for the socket, plus any change it makes to the local session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composed {
    pub line: String,
    /// New username when the line was a `/name` command.
    pub rename: Option<String>,
}

pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn login_line(username: &str) -> String {
    format!("LOGIN:{}\n", single_line(username))
}

pub fn users_request() -> &'static str {
    "USERS\n"
}

pub fn text_message(
    session: &Session,
    content: &str,
    at: NaiveDateTime,
) -> Result<String, CoreError> {
    let message = json!({
        "type": "text",
        "sender": session.username,
        "content": content,
        "timestamp": format_timestamp(at),
    });
    json_line(&message)
}

pub fn private_message(
    session: &Session,
    target: &str,
    content: &str,
    at: NaiveDateTime,
) -> Result<String, CoreError> {
    let message = json!({
        "type": "private",
        "sender": session.username,
        "target": target,
        "content": content,
        "timestamp": format_timestamp(at),
    });
    json_line(&message)
}

/// Chooses the wire form for something the user typed: a `/command`, a
/// private message to the current target, or a public text message.
/// Blank input produces nothing.
pub fn compose(
    session: &Session,
    input: &str,
    at: NaiveDateTime,
) -> Result<Option<Composed>, CoreError> {
    if input.trim().is_empty() {
        return Ok(None);
    }

    if let Some(command) = input.strip_prefix('/') {
        let command = single_line(command);
        let rename = command
            .strip_prefix("name ")
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_owned);
        return Ok(Some(Composed {
            line: format!("{command}\n"),
            rename,
        }));
    }

    let line = match session.private_target() {
        Some(target) => private_message(session, target, input, at)?,
        None => text_message(session, input, at)?,
    };
    Ok(Some(Composed { line, rename: None }))
}

fn json_line(message: &serde_json::Value) -> Result<String, CoreError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Legacy commands are line-delimited, so embedded line breaks become spaces.
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::BROADCAST_TARGET;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|day| day.and_hms_opt(14, 5, 0))
            .expect("valid date")
    }

    #[test]
    fn text_keys_are_sorted() {
        let session = Session::new("alice");
        let line = text_message(&session, "say \"hi\"", noon()).expect("encode");
        assert_eq!(
            line,
            "{\"content\":\"say \\\"hi\\\"\",\"sender\":\"alice\",\"timestamp\":\"2024-03-09 14:05:00\",\"type\":\"text\"}\n"
        );
    }

    #[test]
    fn private_target_selects_private_message() {
        let mut session = Session::new("alice");
        session.set_target("bob");
        let composed = compose(&session, "psst", noon())
            .expect("encode")
            .expect("non-empty");
        assert!(composed.line.contains("\"type\":\"private\""));
        assert!(composed.line.contains("\"target\":\"bob\""));

        session.set_target(BROADCAST_TARGET);
        let composed = compose(&session, "hello", noon())
            .expect("encode")
            .expect("non-empty");
        assert!(composed.line.contains("\"type\":\"text\""));
    }

    #[test]
    fn commands_are_forwarded_without_slash() {
        let session = Session::new("alice");
        let composed = compose(&session, "/name carol", noon())
            .expect("encode")
            .expect("non-empty");
        assert_eq!(composed.line, "name carol\n");
        assert_eq!(composed.rename.as_deref(), Some("carol"));

        let composed = compose(&session, "/USERS", noon())
            .expect("encode")
            .expect("non-empty");
        assert_eq!(composed.line, "USERS\n");
        assert_eq!(composed.rename, None);
    }

    #[test]
    fn blank_input_is_ignored() {
        let session = Session::new("alice");
        assert_eq!(compose(&session, "  \n", noon()).expect("encode"), None);
    }

    #[test]
    fn legacy_lines_are_newline_terminated() {
        assert_eq!(login_line("alice"), "LOGIN:alice\n");
        assert_eq!(users_request(), "USERS\n");
    }
}
