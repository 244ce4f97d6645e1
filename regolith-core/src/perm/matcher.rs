use super::address::{join_host_port, split_host_port};
use crate::error::PolicyError;
use globset::{GlobBuilder, GlobMatcher};
use regolith_config::{Action, RawPolicy};
use std::collections::HashMap;
use tracing::{debug, warn};

/// A compiled glob over `host:port` keys.
///
/// Only `*` (any run of characters) and `?` (one character) are special;
/// brackets, braces and backslashes match literally so IPv6 keys work.
#[derive(Debug, Clone)]
pub struct WildcardMatcher {
    pattern: String,
    glob: GlobMatcher,
    action: Action,
}

impl WildcardMatcher {
    pub fn new(pattern: &str, action: Action) -> Result<Self, globset::Error> {
        let glob = GlobBuilder::new(&escape_pattern(pattern))
            .literal_separator(false)
            .backslash_escape(true)
            .build()?
            .compile_matcher();
        Ok(Self {
            pattern: pattern.to_string(),
            glob,
            action,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn action(&self) -> Action {
        self.action
    }

    #[inline]
    pub fn is_match(&self, destination: &str) -> bool {
        self.glob.is_match(destination)
    }
}

/// Rewrites a `*`/`?` pattern into globset syntax, escaping everything else
/// globset would interpret. Runs of `*` collapse into one.
fn escape_pattern(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len() + 8);
    for c in pattern.chars() {
        match c {
            '*' if escaped.ends_with('*') => {}
            '*' | '?' => escaped.push(c),
            '[' | ']' | '{' | '}' | '\\' | '!' | ',' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

/// One source's rules: exact `host:port` entries, an ordered wildcard
/// list, and the fallback action.
///
/// Direct entries are always consulted before wildcards; wildcards are
/// tried in declaration order and the first match wins.
#[derive(Debug, Clone, Default)]
pub struct AddressMatcher {
    direct: HashMap<String, Action>,
    wildcards: Vec<WildcardMatcher>,
    default: Action,
}

impl AddressMatcher {
    pub fn new(default: Action) -> Self {
        Self {
            default,
            ..Self::default()
        }
    }

    /// Compiles a raw policy, expanding port-less entries against its own
    /// `default_ports`.
    pub fn compile(source_key: &str, raw: &RawPolicy) -> Result<Self, PolicyError> {
        let mut matcher = AddressMatcher::new(raw.default_action);
        debug!(source = source_key, default = %raw.default_action, "Loading policy");

        for (addr_port, &action) in &raw.matches {
            let (host, port) = split_host_port(addr_port);
            let host = host.to_ascii_lowercase();
            match port {
                Some(port) => matcher.insert_direct(join_host_port(&host, port), action),
                None => {
                    if raw.default_ports.is_empty() {
                        warn!(source = source_key, entry = %addr_port, "Entry has no port and default_ports is empty, skipping");
                    }
                    for default_port in &raw.default_ports {
                        matcher.insert_direct(join_host_port(&host, default_port), action);
                    }
                }
            }
        }

        for rule in &raw.match_wildcard {
            let (host, port) = split_host_port(&rule.pattern);
            let patterns: Vec<String> = match port {
                Some(_) => vec![rule.pattern.to_ascii_lowercase()],
                None => {
                    if raw.default_ports.is_empty() {
                        warn!(source = source_key, entry = %rule.pattern, "Wildcard has no port and default_ports is empty, skipping");
                    }
                    let host = host.to_ascii_lowercase();
                    raw.default_ports
                        .iter()
                        .map(|default_port| join_host_port(&host, default_port))
                        .collect()
                }
            };
            for pattern in patterns {
                debug!(source = source_key, pattern = %pattern, action = %rule.action, "Loading wildcard");
                let wildcard = WildcardMatcher::new(&pattern, rule.action).map_err(|source| {
                    PolicyError::InvalidPattern {
                        source_key: source_key.to_string(),
                        pattern: pattern.clone(),
                        source,
                    }
                })?;
                matcher.push_wildcard(wildcard);
            }
        }

        Ok(matcher)
    }

    /// Adds a direct rule, keeping the more severe action on collision.
    pub fn insert_direct(&mut self, destination: String, action: Action) {
        debug!(destination = %destination, action = %action, "Loading target");
        self.direct
            .entry(destination)
            .and_modify(|existing| *existing = Action::most_severe(*existing, action))
            .or_insert(action);
    }

    /// Appends a wildcard rule at the lowest priority.
    pub fn push_wildcard(&mut self, wildcard: WildcardMatcher) {
        self.wildcards.push(wildcard);
    }

    #[inline]
    pub fn match_direct(&self, destination: &str) -> Option<Action> {
        self.direct.get(destination).copied()
    }

    #[inline]
    pub fn match_wildcard(&self, destination: &str) -> Option<Action> {
        self.wildcards
            .iter()
            .find(|w| w.is_match(destination))
            .map(WildcardMatcher::action)
    }

    /// Direct lookup, then wildcards in order, then the default.
    pub fn matches(&self, destination: &str) -> Action {
        self.match_direct(destination)
            .or_else(|| self.match_wildcard(destination))
            .unwrap_or(self.default)
    }

    pub fn default_action(&self) -> Action {
        self.default
    }

    pub fn direct_len(&self) -> usize {
        self.direct.len()
    }

    pub fn wildcards(&self) -> &[WildcardMatcher] {
        &self.wildcards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regolith_config::WildcardRule;
    use std::collections::BTreeMap;

    fn raw(default_ports: Vec<u16>) -> RawPolicy {
        RawPolicy {
            default_action: Action::Deny,
            default_ports,
            matches: BTreeMap::new(),
            match_wildcard: Vec::new(),
        }
    }

    #[test]
    fn test_empty_matcher_returns_default() {
        let matcher = AddressMatcher::new(Action::Ignore);
        assert_eq!(matcher.matches("example.com:80"), Action::Ignore);
        assert_eq!(AddressMatcher::default().matches("x:1"), Action::Deny);
    }

    #[test]
    fn test_default_port_expansion() {
        let mut policy = raw(vec![80, 443]);
        policy.matches.insert("example.com".into(), Action::Accept);
        policy.matches.insert("example.org:8080".into(), Action::Ignore);

        let matcher = AddressMatcher::compile("$global", &policy).unwrap();
        assert_eq!(matcher.direct_len(), 3);
        assert_eq!(matcher.matches("example.com:80"), Action::Accept);
        assert_eq!(matcher.matches("example.com:443"), Action::Accept);
        assert_eq!(matcher.matches("example.com:22"), Action::Deny);
        assert_eq!(matcher.matches("example.org:8080"), Action::Ignore);
        assert_eq!(matcher.matches("example.org:80"), Action::Deny);
    }

    #[test]
    fn test_no_default_ports_drops_portless_entries() {
        let mut policy = raw(vec![]);
        policy.matches.insert("example.com".into(), Action::Accept);
        policy
            .match_wildcard
            .push(WildcardRule::new("*.example.com", Action::Accept));

        let matcher = AddressMatcher::compile("$global", &policy).unwrap();
        assert_eq!(matcher.direct_len(), 0);
        assert!(matcher.wildcards().is_empty());
    }

    #[test]
    fn test_direct_collision_keeps_most_severe() {
        let mut policy = raw(vec![80]);
        policy.matches.insert("example.com".into(), Action::Accept);
        policy.matches.insert("EXAMPLE.com:80".into(), Action::Ignore);

        let matcher = AddressMatcher::compile("$global", &policy).unwrap();
        assert_eq!(matcher.direct_len(), 1);
        assert_eq!(matcher.matches("example.com:80"), Action::Ignore);
    }

    #[test]
    fn test_insert_direct_merges() {
        let mut matcher = AddressMatcher::new(Action::Accept);
        matcher.insert_direct("a:1".into(), Action::Accept);
        matcher.insert_direct("a:1".into(), Action::Deny);
        matcher.insert_direct("a:1".into(), Action::Ignore);
        assert_eq!(matcher.match_direct("a:1"), Some(Action::Deny));
    }

    #[test]
    fn test_wildcards_first_match_wins() {
        let mut policy = raw(vec![443]);
        policy
            .match_wildcard
            .push(WildcardRule::new("*.internal.example.com", Action::Deny));
        policy
            .match_wildcard
            .push(WildcardRule::new("*.example.com", Action::Accept));
        policy
            .match_wildcard
            .push(WildcardRule::new("*:80", Action::Ignore));

        let matcher = AddressMatcher::compile("$global", &policy).unwrap();
        assert_eq!(matcher.matches("db.internal.example.com:443"), Action::Deny);
        assert_eq!(matcher.matches("www.example.com:443"), Action::Accept);
        assert_eq!(matcher.matches("www.example.com:80"), Action::Ignore);
    }

    #[test]
    fn test_direct_before_wildcard() {
        let mut policy = raw(vec![80]);
        policy.matches.insert("www.example.com".into(), Action::Ignore);
        policy
            .match_wildcard
            .push(WildcardRule::new("*.example.com", Action::Accept));

        let matcher = AddressMatcher::compile("$global", &policy).unwrap();
        assert_eq!(matcher.matches("www.example.com:80"), Action::Ignore);
        assert_eq!(matcher.matches("api.example.com:80"), Action::Accept);
    }

    #[test]
    fn test_question_mark_and_literals() {
        let w = WildcardMatcher::new("host?.example.com:80", Action::Accept).unwrap();
        assert!(w.is_match("host1.example.com:80"));
        assert!(!w.is_match("host12.example.com:80"));

        let v6 = WildcardMatcher::new("[fe80::*]:22", Action::Deny).unwrap();
        assert!(v6.is_match("[fe80::1]:22"));
        assert!(!v6.is_match("[fe81::1]:22"));

        let braces = WildcardMatcher::new("{a,b}:80", Action::Deny).unwrap();
        assert!(braces.is_match("{a,b}:80"));
        assert!(!braces.is_match("a:80"));
    }

    #[test]
    fn test_escape_pattern() {
        assert_eq!(escape_pattern("**.example.com"), "*.example.com");
        assert_eq!(escape_pattern("[::1]:*"), "\\[::1\\]:*");
    }

    #[test]
    fn test_ipv6_wildcard_expansion() {
        let mut policy = raw(vec![22]);
        policy
            .match_wildcard
            .push(WildcardRule::new("fe80::*", Action::Deny));

        let matcher = AddressMatcher::compile("$global", &policy).unwrap();
        assert_eq!(matcher.wildcards()[0].pattern(), "[fe80::*]:22");
        assert_eq!(matcher.match_wildcard("[fe80::abcd]:22"), Some(Action::Deny));
    }
}
