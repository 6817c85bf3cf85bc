//! Typed payload decoding and wire encoding
//!
//! Every inbound message becomes an [`Inbound`] value tagged by what it
//! carries. Decoding failures are per-item [`PayloadError`]s and never panic.

use crate::domain::{AgentId, JoinToken};
use crate::error::PayloadError;

use super::topics::{Channel, TopicKey};

/// Join or leave request on the announcement topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    /// `1`, optionally followed by a join token
    Join(Option<JoinToken>),
    /// `-1`, optionally followed by the leaving agent's identity
    Leave(Option<AgentId>),
}

/// Identity published on the shared index topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexAssignment {
    pub id: AgentId,
    /// Echo of the joining agent's token, if it sent one
    pub token: Option<JoinToken>,
}

impl IndexAssignment {
    /// Check whether an agent that joined with `token` should accept this
    pub fn is_for(&self, token: Option<&JoinToken>) -> bool {
        match (&self.token, token) {
            (Some(theirs), Some(ours)) => theirs == ours,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }
}

/// A decoded message, tagged by its semantic channel
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Announcement(Announcement),
    Index(IndexAssignment),
    MasterStatus(bool),
    Start(bool),
    Status(bool),
    Action(u32),
    Observation(Vec<f32>),
    Reward(f32),
    Done(bool),
}

impl Inbound {
    /// Decode a payload according to the channel its topic names
    pub fn decode(key: &TopicKey, payload: &[u8]) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
        match key {
            TopicKey::Announce => parse_announcement(text).map(Self::Announcement),
            TopicKey::Index => parse_index(text).map(Self::Index),
            TopicKey::MasterStatus => parse_flag(text).map(Self::MasterStatus),
            TopicKey::Agent(_, channel) => match channel {
                Channel::Start => parse_flag(text).map(Self::Start),
                Channel::Status => parse_flag(text).map(Self::Status),
                Channel::Action => parse_action(text).map(Self::Action),
                Channel::Observation => parse_observation(text).map(Self::Observation),
                Channel::Reward => parse_reward(text).map(Self::Reward),
                Channel::Done => parse_done(text).map(Self::Done),
            },
        }
    }

    /// Boolean value of a gate-class message
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::MasterStatus(v) | Self::Start(v) | Self::Status(v) => Some(*v),
            _ => None,
        }
    }
}

fn finite(value: f32, expected: &'static str, raw: &str) -> Result<f32, PayloadError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(PayloadError::invalid(expected, raw))
    }
}

/// Parse `[f f f]`; brackets optional, whitespace and/or comma separated
pub fn parse_observation(text: &str) -> Result<Vec<f32>, PayloadError> {
    const EXPECTED: &str = "observation vector";
    let trimmed = text.trim();
    let inner = match (trimmed.strip_prefix('['), trimmed.ends_with(']')) {
        (Some(rest), true) => &rest[..rest.len() - 1],
        (None, false) => trimmed,
        _ => return Err(PayloadError::invalid(EXPECTED, text)),
    };

    inner
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f32>()
                .map_err(|_| PayloadError::invalid(EXPECTED, text))
                .and_then(|v| finite(v, EXPECTED, text))
        })
        .collect()
}

/// Parse a decimal float reward
pub fn parse_reward(text: &str) -> Result<f32, PayloadError> {
    const EXPECTED: &str = "decimal reward";
    let value = text
        .trim()
        .parse::<f32>()
        .map_err(|_| PayloadError::invalid(EXPECTED, text))?;
    finite(value, EXPECTED, text)
}

/// Parse `True`/`False` (any case) or `1`/`0`
pub fn parse_done(text: &str) -> Result<bool, PayloadError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(PayloadError::invalid("True or False", text)),
    }
}

/// Parse a retained boolean gate: `1`/`0` or `true`/`false`
pub fn parse_flag(text: &str) -> Result<bool, PayloadError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(PayloadError::invalid("0 or 1", text)),
    }
}

/// Parse a non-negative action index
pub fn parse_action(text: &str) -> Result<u32, PayloadError> {
    text.trim()
        .parse::<u32>()
        .map_err(|_| PayloadError::invalid("action index", text))
}

/// Parse `1 [token]` or `-1 [id]`
pub fn parse_announcement(text: &str) -> Result<Announcement, PayloadError> {
    const EXPECTED: &str = "1 or -1";
    let mut parts = text.split_whitespace();
    let kind = parts.next().ok_or_else(|| PayloadError::invalid(EXPECTED, text))?;
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(PayloadError::invalid(EXPECTED, text));
    }

    match kind {
        "1" => {
            let token = match arg {
                Some(t) => Some(JoinToken::from_string(t).ok_or_else(|| PayloadError::invalid(EXPECTED, text))?),
                None => None,
            };
            Ok(Announcement::Join(token))
        }
        "-1" => {
            let id = match arg {
                Some(a) => Some(a.parse::<AgentId>().map_err(|_| PayloadError::invalid(EXPECTED, text))?),
                None => None,
            };
            Ok(Announcement::Leave(id))
        }
        _ => Err(PayloadError::invalid(EXPECTED, text)),
    }
}

/// Parse `id [token]`
pub fn parse_index(text: &str) -> Result<IndexAssignment, PayloadError> {
    const EXPECTED: &str = "agent index";
    let mut parts = text.split_whitespace();
    let id = parts
        .next()
        .and_then(|s| s.parse::<AgentId>().ok())
        .ok_or_else(|| PayloadError::invalid(EXPECTED, text))?;
    let token = match parts.next() {
        Some(t) => Some(JoinToken::from_string(t).ok_or_else(|| PayloadError::invalid(EXPECTED, text))?),
        None => None,
    };
    if parts.next().is_some() {
        return Err(PayloadError::invalid(EXPECTED, text));
    }
    Ok(IndexAssignment { id, token })
}

/// Encode an observation as `[f f f]`
pub fn encode_observation(values: &[f32]) -> String {
    let inner: Vec<String> = values.iter().map(|v| format!("{:?}", v)).collect();
    format!("[{}]", inner.join(" "))
}

pub fn encode_reward(value: f32) -> String {
    format!("{:?}", value)
}

pub fn encode_done(done: bool) -> &'static str {
    if done { "True" } else { "False" }
}

pub fn encode_flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

pub fn encode_announcement(announcement: &Announcement) -> String {
    match announcement {
        Announcement::Join(Some(token)) => format!("1 {}", token),
        Announcement::Join(None) => "1".to_string(),
        Announcement::Leave(Some(id)) => format!("-1 {}", id),
        Announcement::Leave(None) => "-1".to_string(),
    }
}

pub fn encode_index(assignment: &IndexAssignment) -> String {
    match &assignment.token {
        Some(token) => format!("{} {}", assignment.id, token),
        None => assignment.id.to_string(),
    }
}
