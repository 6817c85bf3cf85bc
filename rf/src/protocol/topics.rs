//! Topic schema shared by the coordinator and agents

use std::fmt;

use crate::domain::AgentId;

/// Fleet-wide join/leave announcements (agent -> coordinator)
pub const ANNOUNCE_TOPIC: &str = "agents/add";

/// Fleet-wide identity allocations (coordinator -> joining agents)
pub const INDEX_TOPIC: &str = "agents/index";

/// Retained coordinator liveness beacon
pub const MASTER_STATUS_TOPIC: &str = "master/status";

/// Per-agent channel under `agents/{id}/`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Retained start gate (coordinator -> agent)
    Start,
    /// Retained readiness (agent -> coordinator)
    Status,
    /// Action index (coordinator -> agent)
    Action,
    /// Observation vector (agent -> coordinator)
    Observation,
    /// Step reward (agent -> coordinator)
    Reward,
    /// Episode done flag (agent -> coordinator)
    Done,
}

impl Channel {
    /// The three responses an agent publishes for every step
    pub const STEP_RESPONSES: [Channel; 3] = [Channel::Observation, Channel::Reward, Channel::Done];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Status => "status",
            Self::Action => "action",
            Self::Observation => "obv",
            Self::Reward => "reward",
            Self::Done => "done",
        }
    }

    fn from_level(level: &str) -> Option<Self> {
        match level {
            "start" => Some(Self::Start),
            "status" => Some(Self::Status),
            "action" => Some(Self::Action),
            "obv" => Some(Self::Observation),
            "reward" => Some(Self::Reward),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A semantic channel identified by its topic path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKey {
    Announce,
    Index,
    MasterStatus,
    Agent(AgentId, Channel),
}

impl TopicKey {
    /// Classify a concrete topic; None for topics outside the schema
    pub fn parse(topic: &str) -> Option<Self> {
        match topic {
            ANNOUNCE_TOPIC => return Some(Self::Announce),
            INDEX_TOPIC => return Some(Self::Index),
            MASTER_STATUS_TOPIC => return Some(Self::MasterStatus),
            _ => {}
        }

        let mut levels = topic.split('/');
        let (Some("agents"), Some(id), Some(channel), None) =
            (levels.next(), levels.next(), levels.next(), levels.next())
        else {
            return None;
        };
        // Reject forms like "+1" or " 1" that u32 parsing would otherwise accept
        if !id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let id = id.parse::<AgentId>().ok()?;
        Channel::from_level(channel).map(|c| Self::Agent(id, c))
    }

    /// Shorthand for a per-agent key
    pub fn agent(id: AgentId, channel: Channel) -> Self {
        Self::Agent(id, channel)
    }

    /// The concrete topic string
    pub fn topic(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Announce => write!(f, "{}", ANNOUNCE_TOPIC),
            Self::Index => write!(f, "{}", INDEX_TOPIC),
            Self::MasterStatus => write!(f, "{}", MASTER_STATUS_TOPIC),
            Self::Agent(id, channel) => write!(f, "agents/{}/{}", id, channel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_topics() {
        assert_eq!(TopicKey::parse("agents/add"), Some(TopicKey::Announce));
        assert_eq!(TopicKey::parse("agents/index"), Some(TopicKey::Index));
        assert_eq!(TopicKey::parse("master/status"), Some(TopicKey::MasterStatus));
    }

    #[test]
    fn test_agent_topics() {
        let key = TopicKey::parse("agents/12/obv").unwrap();
        assert_eq!(key, TopicKey::agent(AgentId::new(12), Channel::Observation));
        assert_eq!(key.topic(), "agents/12/obv");

        for channel in [
            Channel::Start,
            Channel::Status,
            Channel::Action,
            Channel::Observation,
            Channel::Reward,
            Channel::Done,
        ] {
            let key = TopicKey::agent(AgentId::new(0), channel);
            assert_eq!(TopicKey::parse(&key.topic()), Some(key));
        }
    }

    #[test]
    fn test_unknown_topics() {
        assert_eq!(TopicKey::parse("agents/0/unknown"), None);
        assert_eq!(TopicKey::parse("agents/x/obv"), None);
        assert_eq!(TopicKey::parse("agents/+1/obv"), None);
        assert_eq!(TopicKey::parse("agents/0/obv/extra"), None);
        assert_eq!(TopicKey::parse("/agents/add"), None);
        assert_eq!(TopicKey::parse("robots/0/obv"), None);
    }
}
