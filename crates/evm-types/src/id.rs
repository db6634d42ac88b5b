//! Matrix identifier grammar (Appendix 4.2).
//!
//! Every identifier takes the form `<sigil><localpart>:<domain>`. The sigil
//! fixes the kind of entity; the grammar of the localpart depends on it.
//! Event and room ids are opaque and server-assigned, so only the sigil and
//! the overall length are validated for them. User ids additionally
//! constrain the localpart alphabet.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum length of any identifier, including its sigil and domain.
pub const MAX_ID_LEN: usize = 255;

/// The sigil characters that prefix each identifier kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sigil {
    /// `@` user id.
    User,
    /// `$` event id.
    Event,
    /// `!` room id.
    Room,
    /// `#` room alias.
    RoomAlias,
    /// `+` group id.
    Group,
    /// `:` node (server) id.
    Node,
    /// `%` device id.
    Device,
}

impl Sigil {
    /// The single ASCII character identifying this sigil.
    pub fn char(self) -> char {
        match self {
            Sigil::User => '@',
            Sigil::Event => '$',
            Sigil::Room => '!',
            Sigil::RoomAlias => '#',
            Sigil::Group => '+',
            Sigil::Node => ':',
            Sigil::Device => '%',
        }
    }
}

/// Errors raised while validating or constructing an identifier.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdError {
    /// The identifier did not start with the expected sigil.
    #[error("identifier {0:?} missing sigil {1:?}")]
    BadSigil(String, char),
    /// The identifier exceeded [`MAX_ID_LEN`] bytes.
    #[error("identifier {0:?} exceeds {MAX_ID_LEN} bytes")]
    TooLong(String),
    /// The identifier had no `:domain` part.
    #[error("identifier {0:?} missing :domain")]
    MissingDomain(String),
    /// The localpart is empty.
    #[error("identifier {0:?} has an empty localpart")]
    EmptyLocalpart(String),
    /// The localpart contains a character outside the allowed alphabet.
    #[error("identifier {0:?} localpart contains invalid character {1:?}")]
    InvalidLocalpart(String, char),
}

/// Validate `raw` against the grammar for `sigil`, without constructing a
/// typed id. User ids additionally restrict the localpart alphabet to
/// `a-z 0-9 . _ = - /`; every other kind is only checked for sigil, length,
/// and the presence of a domain.
pub fn validate(sigil: Sigil, raw: &str) -> Result<(), IdError> {
    if raw.len() > MAX_ID_LEN {
        return Err(IdError::TooLong(raw.to_string()));
    }
    let mut chars = raw.chars();
    match chars.next() {
        Some(c) if c == sigil.char() => {}
        _ => return Err(IdError::BadSigil(raw.to_string(), sigil.char())),
    }
    let rest = &raw[sigil.char().len_utf8()..];
    let colon = rest.find(':').ok_or_else(|| IdError::MissingDomain(raw.to_string()))?;
    let localpart = &rest[..colon];
    if localpart.is_empty() {
        return Err(IdError::EmptyLocalpart(raw.to_string()));
    }
    if matches!(sigil, Sigil::User) {
        if let Some(bad) = localpart
            .chars()
            .find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.' | '_' | '=' | '-' | '/'))
        {
            return Err(IdError::InvalidLocalpart(raw.to_string(), bad));
        }
    }
    Ok(())
}

macro_rules! mxid {
    ($name:ident, $sigil:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Construct from a raw string, validating the grammar.
            pub fn parse(raw: impl Into<String>) -> Result<Self, IdError> {
                let raw = raw.into();
                validate($sigil, &raw)?;
                Ok(Self(raw))
            }

            /// Borrow the full identifier, sigil included.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// The domain part (after the `:`), excluding any port.
            pub fn domain(&self) -> &str {
                let rest = &self.0[1..];
                let colon = rest.find(':').expect("validated at construction");
                &rest[colon + 1..]
            }

            /// The localpart, sigil excluded.
            pub fn localpart(&self) -> &str {
                let rest = &self.0[1..];
                let colon = rest.find(':').expect("validated at construction");
                &rest[..colon]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;
            fn try_from(raw: String) -> Result<Self, IdError> {
                Self::parse(raw)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

mxid!(UserId, Sigil::User, "A Matrix user id, `@localpart:domain`.");
mxid!(EventId, Sigil::Event, "A Matrix event id, `$opaque:domain`.");
mxid!(RoomId, Sigil::Room, "A Matrix room id, `!opaque:domain`.");
mxid!(RoomAliasId, Sigil::RoomAlias, "A Matrix room alias, `#alias:domain`.");

/// A bare server name (the `domain` part of any identifier), used for
/// `Event::origin` and as the domain injected by the commit composer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerName(pub String);

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_user_id() {
        assert!(UserId::parse("@alice:example.org").is_ok());
    }

    #[test]
    fn user_id_rejects_bad_localpart_chars() {
        assert_eq!(
            UserId::parse("@Alice:example.org"),
            Err(IdError::InvalidLocalpart("@Alice:example.org".into(), 'A'))
        );
    }

    #[test]
    fn event_id_allows_opaque_localpart() {
        assert!(EventId::parse("$AAA_bbb-123:example.org").is_ok());
    }

    #[test]
    fn rejects_wrong_sigil() {
        assert_eq!(
            EventId::parse("@alice:example.org"),
            Err(IdError::BadSigil("@alice:example.org".into(), '$'))
        );
    }

    #[test]
    fn rejects_missing_domain() {
        assert_eq!(
            RoomId::parse("!noroom"),
            Err(IdError::MissingDomain("!noroom".into()))
        );
    }

    #[test]
    fn rejects_oversized_id() {
        let long = format!("@{}:example.org", "a".repeat(300));
        assert!(matches!(UserId::parse(long), Err(IdError::TooLong(_))));
    }

    #[test]
    fn domain_and_localpart_accessors() {
        let id = RoomId::parse("!abc123:example.org").unwrap();
        assert_eq!(id.localpart(), "abc123");
        assert_eq!(id.domain(), "example.org");
    }

    #[test]
    fn roundtrips_through_serde() {
        let id = UserId::parse("@bob:example.org").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
