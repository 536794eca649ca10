use crate::BROADCAST_TARGET;

/// Per-connection identity and chat target, owned by whoever drives the
/// connection and passed into decoding and composing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub username: String,
    pub current_target: String,
}

impl Session {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            current_target: BROADCAST_TARGET.to_owned(),
        }
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        let target = target.into();
        let trimmed = target.trim();
        self.current_target = if trimmed.is_empty() {
            BROADCAST_TARGET.to_owned()
        } else {
            trimmed.to_owned()
        };
    }

    /// The peer of a private conversation, or `None` when talking to everyone.
    pub fn private_target(&self) -> Option<&str> {
        let target = self.current_target.as_str();
        if target.is_empty() || target == BROADCAST_TARGET || target == self.username {
            None
        } else {
            Some(target)
        }
    }

    pub fn is_self(&self, name: &str) -> bool {
        !self.username.is_empty() && self.username == name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_name_and_broadcast_are_public() {
        let mut session = Session::new("alice");
        assert_eq!(session.private_target(), None);

        session.set_target("alice");
        assert_eq!(session.private_target(), None);

        session.set_target("bob");
        assert_eq!(session.private_target(), Some("bob"));

        session.set_target("  ");
        assert_eq!(session.current_target, BROADCAST_TARGET);
    }
}
