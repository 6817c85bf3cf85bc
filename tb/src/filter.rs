//! Topic validation and wildcard filter matching

use std::fmt;

use tracing::debug;

use crate::error::BusError;

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Validate a concrete topic name
///
/// Topics are `/`-separated with non-empty levels and contain no wildcards.
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    debug!(%topic, "validate_topic: called");
    let invalid = |reason: &str| BusError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    };

    if topic.is_empty() {
        return Err(invalid("empty topic"));
    }
    if topic.contains(['+', '#']) {
        return Err(invalid("wildcards are not allowed in topic names"));
    }
    if topic.split('/').any(str::is_empty) {
        return Err(invalid("empty level"));
    }
    Ok(())
}

/// A subscription filter, possibly containing `+` and `#` wildcards
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    raw: String,
    levels: Vec<String>,
}

impl TopicFilter {
    /// Parse and validate a filter
    pub fn parse(filter: &str) -> Result<Self, BusError> {
        debug!(%filter, "TopicFilter::parse: called");
        let invalid = |reason: &str| BusError::InvalidFilter {
            filter: filter.to_string(),
            reason: reason.to_string(),
        };

        if filter.is_empty() {
            return Err(invalid("empty filter"));
        }

        let levels: Vec<String> = filter.split('/').map(str::to_string).collect();
        let last = levels.len() - 1;
        for (i, level) in levels.iter().enumerate() {
            if level.is_empty() {
                return Err(invalid("empty level"));
            }
            if level == MULTI_LEVEL {
                if i != last {
                    return Err(invalid("'#' must be the last level"));
                }
            } else if level != SINGLE_LEVEL && level.contains(['+', '#']) {
                return Err(invalid("wildcards must occupy a whole level"));
            }
        }

        Ok(Self {
            raw: filter.to_string(),
            levels,
        })
    }

    /// The filter as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check if the filter contains any wildcard
    pub fn is_wildcard(&self) -> bool {
        self.levels.iter().any(|l| l == SINGLE_LEVEL || l == MULTI_LEVEL)
    }

    /// Check whether a concrete topic matches this filter
    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_levels = topic.split('/');

        for level in &self.levels {
            if level == MULTI_LEVEL {
                return true;
            }
            match topic_levels.next() {
                Some(t) if level == SINGLE_LEVEL || level == t => continue,
                _ => return false,
            }
        }

        topic_levels.next().is_none()
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("agents/0/obv").is_ok());
        assert!(validate_topic("master/status").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("agents/+/obv").is_err());
        assert!(validate_topic("agents/#").is_err());
        assert!(validate_topic("agents//obv").is_err());
        assert!(validate_topic("/agents/add").is_err());
    }

    #[test]
    fn test_exact_filter() {
        let filter = TopicFilter::parse("agents/add").unwrap();
        assert!(!filter.is_wildcard());
        assert!(filter.matches("agents/add"));
        assert!(!filter.matches("agents/index"));
        assert!(!filter.matches("agents/add/more"));
        assert!(!filter.matches("agents"));
    }

    #[test]
    fn test_single_level_wildcard() {
        let filter = TopicFilter::parse("agents/+/obv").unwrap();
        assert!(filter.is_wildcard());
        assert!(filter.matches("agents/0/obv"));
        assert!(filter.matches("agents/17/obv"));
        assert!(!filter.matches("agents/0/reward"));
        assert!(!filter.matches("agents/obv"));
        assert!(!filter.matches("agents/0/1/obv"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        let filter = TopicFilter::parse("agents/3/#").unwrap();
        assert!(filter.matches("agents/3/obv"));
        assert!(filter.matches("agents/3/a/b/c"));
        assert!(filter.matches("agents/3"));
        assert!(!filter.matches("agents/4/obv"));

        let everything = TopicFilter::parse("#").unwrap();
        assert!(everything.matches("master/status"));
    }

    #[test]
    fn test_invalid_filters() {
        assert!(TopicFilter::parse("").is_err());
        assert!(TopicFilter::parse("agents/#/obv").is_err());
        assert!(TopicFilter::parse("agents/a+/obv").is_err());
        assert!(TopicFilter::parse("agents//obv").is_err());
    }

    proptest! {
        #[test]
        fn prop_exact_filter_matches_only_itself(
            a in "[a-z0-9]{1,6}",
            b in "[a-z0-9]{1,6}",
            c in "[a-z0-9]{1,6}",
        ) {
            let topic = format!("{a}/{b}");
            let filter = TopicFilter::parse(&topic).unwrap();
            prop_assert!(filter.matches(&topic));
            let other = format!("{a}/{b}/{c}");
            prop_assert!(!filter.matches(&other));
            let wild = TopicFilter::parse(&format!("{a}/+")).unwrap();
            prop_assert!(wild.matches(&topic));
        }
    }
}
