//! The opaque Telegram session credential, handled so it can never leak.
//!
//! `SessionMaterial` is unquotable by construction: `Debug`/`Display` always render
//! `***`, and `serde::Serialize` does the same, so it is safe to embed in any struct
//! that might incidentally be logged or serialized into an event. The one trapdoor,
//! `reveal_for_transport`, is reserved for the (external) transport capability.

use std::fmt;

use serde::{Serialize, Serializer};

#[derive(Clone)]
pub struct SessionMaterial(String);

impl SessionMaterial {
    pub fn new(plaintext: impl Into<String>) -> Self {
        Self(plaintext.into())
    }

    /// The only sanctioned way to obtain the plaintext. Callers outside the
    /// transport-bootstrap path should never need this.
    pub fn reveal_for_transport(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

impl fmt::Display for SessionMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

impl Serialize for SessionMaterial {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("***")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_prints_plaintext() {
        let m = SessionMaterial::new("super-secret-token");
        assert_eq!(format!("{m}"), "***");
        assert_eq!(format!("{m:?}"), "***");
        assert_eq!(serde_json::to_string(&m).unwrap(), "\"***\"");
        assert_eq!(m.reveal_for_transport(), "super-secret-token");
    }
}
