use std::borrow::Borrow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::str::FromStr;

/// The maximum length a `ClientId` is allowed to be.
///
/// The specification allows implementations to reject client IDs longer than
/// this, and this broker does.
pub const MAX_LEN: usize = 23;

/// A validated MQTT client identifier: non-empty UTF-8, at most 23 bytes.
///
/// An empty client id in a CONNECT is answered with CONNACK
/// `IdentifierRejected` rather than a broker-assigned id, so every session in
/// the broker carries an id the client chose.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ClientId(Box<str>);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0.into()
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("client ID cannot be empty")]
    Empty,
    #[error("expected a client ID length between 1 and {MAX_LEN} bytes, got {0}")]
    TooLong(usize),
}

impl FromStr for ClientId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        if s.len() > MAX_LEN {
            return Err(ParseError::TooLong(s.len()));
        }

        Ok(ClientId(s.into()))
    }
}

impl Deref for ClientId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl Debug for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ClientId").field(&self.as_str()).finish()
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self.as_str(), f)
    }
}

impl From<ClientId> for String {
    fn from(value: ClientId) -> Self {
        value.into_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty() {
        assert_eq!(ClientId::from_str(""), Err(ParseError::Empty));
    }

    #[test]
    fn accepts_up_to_23_bytes() {
        let id = "a".repeat(23);
        assert_eq!(ClientId::from_str(&id).unwrap().as_str(), id);
    }

    #[test]
    fn rejects_24_bytes() {
        let id = "a".repeat(24);
        assert_eq!(ClientId::from_str(&id), Err(ParseError::TooLong(24)));
    }

    #[test]
    fn length_limit_is_bytes_not_chars() {
        // Twelve two-byte characters: 12 chars, 24 bytes.
        let id = "é".repeat(12);
        assert_eq!(ClientId::from_str(&id), Err(ParseError::TooLong(24)));
    }

    #[test]
    fn accepts_typical_generated_ids() {
        // The shape MQTT.js generates by default.
        assert!(ClientId::from_str("mqttjs_684dbee5").is_ok());
    }
}
