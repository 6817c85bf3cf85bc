//! Agent identities and join tokens

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PayloadError;

/// Small non-negative integer identifying one live agent
///
/// Assigned once by the coordinator's index allocator and never reused within
/// one coordinator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(u32);

impl AgentId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// The identity handed out after this one, None once the space is spent
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AgentId {
    type Err = PayloadError;

    /// Decimal digits only; signs and other prefixes are rejected
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PayloadError::invalid("agent id", s));
        }
        digits
            .parse::<u32>()
            .map(Self)
            .map_err(|_| PayloadError::invalid("agent id", s))
    }
}

/// Token a joining agent attaches to its announcement
///
/// The allocator echoes it next to the allocated identity so every agent
/// watching the shared index topic can discard allocations meant for others.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinToken(String);

impl JoinToken {
    /// Generate a fresh token
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().simple().to_string())
    }

    /// Create from an existing token string
    ///
    /// Returns None for strings that could not survive the whitespace-separated
    /// wire format.
    pub fn from_string(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        if token.is_empty() || token.contains(char::is_whitespace) {
            return None;
        }
        Some(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JoinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_parse_and_display() {
        let id: AgentId = " 7 ".parse().unwrap();
        assert_eq!(id, AgentId::new(7));
        assert_eq!(id.to_string(), "7");
        assert_eq!(id.next(), Some(AgentId::new(8)));
        assert!("-1".parse::<AgentId>().is_err());
        assert!("+3".parse::<AgentId>().is_err());
        assert!("seven".parse::<AgentId>().is_err());
        assert!("4294967296".parse::<AgentId>().is_err());
    }

    #[test]
    fn test_agent_id_space_ends() {
        assert_eq!(AgentId::new(u32::MAX - 1).next(), Some(AgentId::new(u32::MAX)));
        assert_eq!(AgentId::new(u32::MAX).next(), None);
    }

    #[test]
    fn test_join_tokens_are_unique() {
        let a = JoinToken::generate();
        let b = JoinToken::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().contains(char::is_whitespace));
    }

    #[test]
    fn test_join_token_rejects_whitespace() {
        assert!(JoinToken::from_string("abc").is_some());
        assert!(JoinToken::from_string("a b").is_none());
        assert!(JoinToken::from_string("").is_none());
    }
}
