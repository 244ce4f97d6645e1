//! Raw permission policy as read from `perm.json`/`perm.yaml`.
//!
//! A policy file maps a source key (the client's host, or the reserved
//! `$global` key) to a [`RawPolicy`]. The proxy compiles these into
//! matchers; nothing here interprets the rules.

use crate::{ConfigError, Format, deserialize, read_file};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// What to do with a connection whose destination matched a rule.
///
/// Variants are ordered from most to least severe, so `min` picks the
/// more severe of two actions. The default is `Deny`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    /// Reject with `502 Bad Gateway` and log the attempt.
    #[default]
    Deny,
    /// Reject with `502 Bad Gateway` without logging.
    Ignore,
    /// Proxy the connection.
    Accept,
}

impl Action {
    /// Returns the more severe of the two actions.
    ///
    /// ```
    /// use regolith_config::Action;
    ///
    /// assert_eq!(Action::most_severe(Action::Ignore, Action::Accept), Action::Ignore);
    /// assert_eq!(Action::most_severe(Action::Accept, Action::Deny), Action::Deny);
    /// ```
    pub fn most_severe(a: Action, b: Action) -> Action {
        a.min(b)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Deny => "deny",
            Action::Ignore => "ignore",
            Action::Accept => "accept",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown action: {0}")]
pub struct ParseActionError(String);

impl FromStr for Action {
    type Err = ParseActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("deny") {
            Ok(Action::Deny)
        } else if s.eq_ignore_ascii_case("ignore") {
            Ok(Action::Ignore)
        } else if s.eq_ignore_ascii_case("accept") {
            Ok(Action::Accept)
        } else {
            Err(ParseActionError(s.to_string()))
        }
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// One entry of an ordered wildcard list, written as `{ "<glob>": "<action>" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, Action>",
    into = "BTreeMap<String, Action>"
)]
pub struct WildcardRule {
    pub pattern: String,
    pub action: Action,
}

impl WildcardRule {
    pub fn new(pattern: impl Into<String>, action: Action) -> Self {
        Self {
            pattern: pattern.into(),
            action,
        }
    }
}

impl TryFrom<BTreeMap<String, Action>> for WildcardRule {
    type Error = String;

    fn try_from(map: BTreeMap<String, Action>) -> Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!(
                "wildcard rule must have exactly one key, found {}",
                map.len()
            ));
        }
        map.into_iter()
            .next()
            .map(|(pattern, action)| WildcardRule { pattern, action })
            .ok_or_else(|| "wildcard rule is empty".to_string())
    }
}

impl From<WildcardRule> for BTreeMap<String, Action> {
    fn from(rule: WildcardRule) -> Self {
        BTreeMap::from([(rule.pattern, rule.action)])
    }
}

/// Rules for one source key.
///
/// Entries of `matches` and `match_wildcard` without a port are expanded
/// once per entry of `default_ports`, so keep that list short.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPolicy {
    /// Action when nothing matches
    #[serde(alias = "DefaultAction")]
    pub default_action: Action,
    /// Ports appended to entries written without one
    #[serde(alias = "DefaultPort", alias = "default_port")]
    pub default_ports: Vec<u16>,
    /// Exact `host[:port]` entries
    #[serde(rename = "match", alias = "Match")]
    pub matches: BTreeMap<String, Action>,
    /// Glob entries, searched top to bottom
    #[serde(alias = "MatchWildcard")]
    pub match_wildcard: Vec<WildcardRule>,
}

/// Every source's policy, keyed by source host or [`PolicySet::GLOBAL_KEY`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicySet {
    sources: BTreeMap<String, RawPolicy>,
}

impl PolicySet {
    /// Key holding the global rules, compared case-insensitively.
    pub const GLOBAL_KEY: &'static str = "$global";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_global_key(key: &str) -> bool {
        key.eq_ignore_ascii_case(Self::GLOBAL_KEY)
    }

    pub fn insert(&mut self, source: impl Into<String>, policy: RawPolicy) -> Option<RawPolicy> {
        self.sources.insert(source.into(), policy)
    }

    pub fn get(&self, source: &str) -> Option<&RawPolicy> {
        self.sources.get(source)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawPolicy)> {
        self.sources.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Loads a policy file; `.json` files are JSON, anything else YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = read_file(path)?;
        Self::parse(&contents, Format::from_path(path))
    }

    pub fn parse(contents: &str, format: Format) -> Result<Self, ConfigError> {
        deserialize(contents, format)
    }
}

impl FromIterator<(String, RawPolicy)> for PolicySet {
    fn from_iter<I: IntoIterator<Item = (String, RawPolicy)>>(iter: I) -> Self {
        Self {
            sources: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_order() {
        assert!(Action::Deny < Action::Ignore);
        assert!(Action::Ignore < Action::Accept);
        assert_eq!(Action::default(), Action::Deny);
        assert_eq!(Action::most_severe(Action::Ignore, Action::Deny), Action::Deny);
    }

    #[test]
    fn test_action_text_round_trip() {
        for action in [Action::Deny, Action::Ignore, Action::Accept] {
            assert_eq!(action.to_string().parse::<Action>(), Ok(action));
        }
        assert_eq!("ACCEPT".parse::<Action>(), Ok(Action::Accept));
        assert!("allow".parse::<Action>().is_err());
        assert!("".parse::<Action>().is_err());
    }

    #[test]
    fn test_action_serde() {
        assert_eq!(serde_json::to_string(&Action::Ignore).unwrap(), "\"ignore\"");
        assert_eq!(
            serde_json::from_str::<Action>("\"deny\"").unwrap(),
            Action::Deny
        );
        assert!(serde_json::from_str::<Action>("\"block\"").is_err());
        assert!(serde_json::from_str::<Action>("2").is_err());
    }

    #[test]
    fn test_wildcard_rule_single_key() {
        let rule: WildcardRule = serde_json::from_str(r#"{"*.example.com": "accept"}"#).unwrap();
        assert_eq!(rule, WildcardRule::new("*.example.com", Action::Accept));

        assert!(serde_json::from_str::<WildcardRule>("{}").is_err());
        assert!(
            serde_json::from_str::<WildcardRule>(r#"{"a": "accept", "b": "deny"}"#).is_err()
        );
    }

    #[test]
    fn test_policy_set_json() {
        let json = r#"{
            "$global": {
                "default_action": "deny",
                "default_ports": [80, 443],
                "match": { "example.com": "accept", "example.org:8080": "ignore" },
                "match_wildcard": [ { "*.example.com": "accept" }, { "*": "ignore" } ]
            },
            "10.0.0.5": { "default_action": "accept" }
        }"#;
        let set = PolicySet::parse(json, Format::Json).unwrap();
        assert_eq!(set.len(), 2);

        let global = set.get("$global").unwrap();
        assert_eq!(global.default_ports, vec![80, 443]);
        assert_eq!(global.matches.get("example.com"), Some(&Action::Accept));
        assert_eq!(global.match_wildcard.len(), 2);
        assert_eq!(global.match_wildcard[0].pattern, "*.example.com");
        assert_eq!(global.match_wildcard[1].action, Action::Ignore);

        let source = set.get("10.0.0.5").unwrap();
        assert_eq!(source.default_action, Action::Accept);
        assert!(source.matches.is_empty());
    }

    #[test]
    fn test_policy_legacy_field_names() {
        let json = r#"{
            "$GLOBAL": {
                "DefaultAction": "ignore",
                "DefaultPort": [80],
                "Match": { "example.com": "accept" },
                "MatchWildcard": [ { "*.local": "deny" } ]
            }
        }"#;
        let set = PolicySet::parse(json, Format::Json).unwrap();
        let (key, policy) = set.iter().next().unwrap();
        assert!(PolicySet::is_global_key(key));
        assert_eq!(policy.default_action, Action::Ignore);
        assert_eq!(policy.default_ports, vec![80]);
        assert_eq!(policy.match_wildcard[0].pattern, "*.local");
    }

    #[test]
    fn test_policy_set_yaml() {
        let yaml = r#"
$global:
  default_action: deny
  default_ports: [80]
  match:
    example.com: accept
"#;
        let set = PolicySet::parse(yaml, Format::Yaml).unwrap();
        assert_eq!(
            set.get("$global").unwrap().matches.get("example.com"),
            Some(&Action::Accept)
        );
    }

    #[test]
    fn test_unknown_action_rejected() {
        let json = r#"{ "$global": { "default_action": "allow" } }"#;
        assert!(PolicySet::parse(json, Format::Json).is_err());
    }
}
