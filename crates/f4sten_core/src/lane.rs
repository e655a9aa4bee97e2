use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Joins a logical topic and a lane name into a physical address.
pub const LANE_SEPARATOR: char = '-';

/// The three routing channels of a logical topic.
///
/// Each lane lives on its own physical address, so a PRIORITY record never
/// waits behind a NORMAL backlog.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, EnumString,
    AsRefStr, Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lane {
    Normal,
    Priority,
    Error,
}

impl Lane {
    /// Lanes drained by a regular subscription, in the order `poll` visits them.
    pub const CONSUMED: [Lane; 2] = [Lane::Priority, Lane::Normal];

    /// Physical address of this lane on `topic`.
    pub fn address(self, topic: &str) -> String {
        format!("{topic}{LANE_SEPARATOR}{}", self.as_ref())
    }

    pub fn is_error(self) -> bool {
        self == Lane::Error
    }
}

/// Physical address for `(topic, lane)`.
///
/// Pure and deterministic: producers and consumers started independently
/// agree on it without coordination.
pub fn lane_of(topic: &str, lane: Lane) -> String {
    lane.address(topic)
}

/// Splits a physical address back into its logical topic and lane.
///
/// Only the exact upper-case suffix produced by [`lane_of`] is accepted.
pub fn parse_address(address: &str) -> Option<(&str, Lane)> {
    let (topic, suffix) = address.rsplit_once(LANE_SEPARATOR)?;
    if topic.is_empty() {
        return None;
    }
    let lane: Lane = suffix.parse().ok()?;
    (lane.as_ref() == suffix).then_some((topic, lane))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_lane_qualified() {
        assert_eq!(lane_of("fasten.pom.out", Lane::Normal), "fasten.pom.out-NORMAL");
        assert_eq!(lane_of("fasten.pom.out", Lane::Priority), "fasten.pom.out-PRIORITY");
        assert_eq!(lane_of("fasten.pom.out", Lane::Error), "fasten.pom.out-ERROR");
    }

    #[test]
    fn lanes_of_one_topic_never_share_an_address() {
        let normal = lane_of("t", Lane::Normal);
        let priority = lane_of("t", Lane::Priority);
        let error = lane_of("t", Lane::Error);
        assert_ne!(normal, priority);
        assert_ne!(normal, error);
        assert_ne!(priority, error);
    }

    #[test]
    fn parse_address_recovers_topic_with_dashes() {
        let address = lane_of("my-topic.v2", Lane::Priority);
        assert_eq!(parse_address(&address), Some(("my-topic.v2", Lane::Priority)));
    }

    #[test]
    fn parse_address_rejects_foreign_suffixes() {
        assert_eq!(parse_address("topic-normal"), None);
        assert_eq!(parse_address("topic"), None);
        assert_eq!(parse_address("-NORMAL"), None);
        assert_eq!(parse_address("topic-URGENT"), None);
    }

    #[test]
    fn lane_names_parse_case_insensitively() {
        assert_eq!("priority".parse::<Lane>().unwrap(), Lane::Priority);
        assert_eq!("ERROR".parse::<Lane>().unwrap(), Lane::Error);
        assert_eq!(Lane::Normal.to_string(), "NORMAL");
    }

    #[test]
    fn lane_serializes_as_upper_case_name() {
        assert_eq!(serde_json::to_string(&Lane::Priority).unwrap(), "\"PRIORITY\"");
    }
}
