//! Prefixed identifiers. Fresh ids are UUIDv7, so ids minted by one process
//! sort in creation order; ids read back from storage are taken verbatim.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! ids {
    ($($(#[$doc:meta])* $name:ident => $prefix:literal;)+) => {$(
        $(#[$doc])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!("{}_{}", Self::PREFIX, Uuid::now_v7()))
            }

            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the id carries this type's prefix. Raw ids from
            /// outside (a CLI flag, an old database) may not.
            pub fn is_minted(&self) -> bool {
                self.0
                    .strip_prefix(Self::PREFIX)
                    .is_some_and(|rest| rest.starts_with('_'))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self::from_raw(s))
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    )+};
}

ids! {
    SessionId => "sess";
    MessageId => "msg";
    /// Assigned by the provider when it requests a tool.
    ToolCallId => "call";
    /// A background job; stays valid after the turn that started it ends.
    JobId => "job";
    TurnId => "turn";
    EntryId => "entry";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(ToolCallId::new().as_str().starts_with("call_"));
        assert!(JobId::new().as_str().starts_with("job_"));
        assert!(TurnId::new().as_str().starts_with("turn_"));
        assert!(EntryId::new().as_str().starts_with("entry_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn minted_ids_are_recognised() {
        assert!(JobId::new().is_minted());
        assert!(!JobId::from_raw("jobless").is_minted());
        assert!(!JobId::from_raw(SessionId::new().as_str()).is_minted());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = MessageId::from_raw("msg_fixed");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""msg_fixed""#);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<MessageId> = (0..100).map(|_| MessageId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
