use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use thiserror::Error;

/// A decentralized identifier: `did:key:…` or `did:web:…`.
///
/// DIDs are opaque, self-authenticating identifiers. A `did:key` DID carries
/// its Ed25519 public key in the method-specific part; a `did:web` DID is
/// resolved against the agent registry. Deserialization validates, so a DID
/// that crossed the wire is always well-formed.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Did(String);

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Did::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// The DID method of an identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DidMethod {
    Key,
    Web,
}

impl Did {
    /// Parse and validate a DID string.
    ///
    /// Accepts `did:(key|web):[A-Za-z0-9._-]+` and nothing else.
    pub fn parse(raw: &str) -> Result<Self, DidError> {
        let rest = raw
            .strip_prefix("did:")
            .ok_or_else(|| DidError::InvalidFormat(raw.to_string()))?;

        let (method, specific) = rest
            .split_once(':')
            .ok_or_else(|| DidError::InvalidFormat(raw.to_string()))?;

        if !matches!(method, "key" | "web") {
            return Err(DidError::UnsupportedMethod(method.to_string()));
        }

        if specific.is_empty()
            || !specific
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(DidError::InvalidFormat(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    /// The DID method.
    pub fn method(&self) -> DidMethod {
        if self.0.starts_with("did:key:") {
            DidMethod::Key
        } else {
            DidMethod::Web
        }
    }

    /// The method-specific identifier after the second colon.
    pub fn method_specific(&self) -> &str {
        self.0.splitn(3, ':').nth(2).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Did({})", self.0)
    }
}

impl std::str::FromStr for Did {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// DID parsing errors.
#[derive(Debug, Error)]
pub enum DidError {
    #[error("invalid DID format: {0}")]
    InvalidFormat(String),

    #[error("unsupported DID method: {0}")]
    UnsupportedMethod(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_and_web_methods() {
        let key = Did::parse("did:key:abc123DEF").unwrap();
        assert_eq!(key.method(), DidMethod::Key);
        assert_eq!(key.method_specific(), "abc123DEF");

        let web = Did::parse("did:web:example.com").unwrap();
        assert_eq!(web.method(), DidMethod::Web);
    }

    #[test]
    fn rejects_unknown_method() {
        assert!(matches!(
            Did::parse("did:ion:abc"),
            Err(DidError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn rejects_bad_charset_and_shape() {
        assert!(Did::parse("did:key:").is_err());
        assert!(Did::parse("did:key:with space").is_err());
        assert!(Did::parse("did:key:semi;colon").is_err());
        assert!(Did::parse("not-a-did").is_err());
        assert!(Did::parse("did:key").is_err());
    }

    #[test]
    fn display_round_trips() {
        let raw = "did:web:agents.example.org";
        assert_eq!(Did::parse(raw).unwrap().to_string(), raw);
    }

    #[test]
    fn deserialization_validates() {
        let ok: Did = serde_json::from_str(r#""did:key:abc""#).unwrap();
        assert_eq!(ok.as_str(), "did:key:abc");
        assert!(serde_json::from_str::<Did>(r#""not a did""#).is_err());
        assert!(serde_json::from_str::<Did>(r#""did:ion:abc""#).is_err());
    }
}
