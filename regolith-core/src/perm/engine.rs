use super::address::source_key;
use super::matcher::AddressMatcher;
use crate::error::PolicyError;
use regolith_config::{Action, PolicySet};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::info;

/// An immutable, fully compiled policy: the global matcher plus one
/// matcher per source host.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    global: AddressMatcher,
    per_source: HashMap<String, AddressMatcher>,
    generation: u64,
}

impl PolicySnapshot {
    /// Compiles every source of `policy`. Fails on the first bad pattern or
    /// on a second global key.
    pub fn compile(policy: &PolicySet) -> Result<Self, PolicyError> {
        let mut snapshot = PolicySnapshot::default();
        let mut global_key: Option<&str> = None;

        for (key, raw) in policy.iter() {
            if PolicySet::is_global_key(key) {
                if let Some(first) = global_key {
                    return Err(PolicyError::DuplicateGlobal {
                        first: first.to_string(),
                        second: key.to_string(),
                    });
                }
                global_key = Some(key);
                snapshot.global = AddressMatcher::compile(key, raw)?;
            } else {
                snapshot
                    .per_source
                    .insert(source_key(key), AddressMatcher::compile(key, raw)?);
            }
        }

        Ok(snapshot)
    }

    /// Resolves a destination for a source host.
    ///
    /// Direct rules of both scopes outrank wildcard rules of both scopes;
    /// within a tier the source's own rules come first. Without a match the
    /// source's default applies, or the global default when the source has
    /// no rules of its own.
    pub fn resolve(&self, source: &str, destination: &str) -> Action {
        let own = self.per_source.get(source);

        if let Some(action) = own.and_then(|m| m.match_direct(destination)) {
            return action;
        }
        if let Some(action) = self.global.match_direct(destination) {
            return action;
        }
        if let Some(action) = own.and_then(|m| m.match_wildcard(destination)) {
            return action;
        }
        if let Some(action) = self.global.match_wildcard(destination) {
            return action;
        }

        own.unwrap_or(&self.global).default_action()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn global(&self) -> &AddressMatcher {
        &self.global
    }

    pub fn source(&self, source: &str) -> Option<&AddressMatcher> {
        self.per_source.get(source)
    }

    pub fn source_count(&self) -> usize {
        self.per_source.len()
    }
}

/// Thread-safe, reloadable permission policy.
///
/// Lookups clone the current snapshot under a read lock and evaluate it
/// without holding the lock. [`load`](Self::load) compiles a replacement
/// off to the side and publishes it with a single pointer swap, so a
/// lookup sees either the old policy or the new one, never a mix.
///
/// An engine that has never been loaded denies everything.
#[derive(Debug, Default)]
pub struct PermissionEngine {
    current: RwLock<Option<Arc<PolicySnapshot>>>,
    reload: Mutex<()>,
}

impl PermissionEngine {
    /// Creates an empty engine that resolves every query to `Deny`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine and loads `policy` into it.
    pub fn from_policy(policy: &PolicySet) -> Result<Self, PolicyError> {
        let engine = Self::new();
        engine.load(policy)?;
        Ok(engine)
    }

    /// Replaces the whole policy. On error the previous policy stays active.
    ///
    /// Returns the generation number of the published snapshot.
    pub fn load(&self, policy: &PolicySet) -> Result<u64, PolicyError> {
        // Concurrent loads publish in the order they were compiled
        let _serialized = self.reload.lock().unwrap_or_else(PoisonError::into_inner);

        let mut snapshot = PolicySnapshot::compile(policy)?;

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        snapshot.generation = current.as_ref().map_or(0, |s| s.generation) + 1;
        let generation = snapshot.generation;
        info!(
            generation,
            sources = snapshot.source_count(),
            global_direct = snapshot.global.direct_len(),
            global_wildcards = snapshot.global.wildcards().len(),
            "Permission policy loaded"
        );
        *current = Some(Arc::new(snapshot));
        Ok(generation)
    }

    /// Resolves `(source host, destination host:port)` to an action.
    pub fn resolve(&self, source: &str, destination: &str) -> Action {
        match self.snapshot() {
            Some(snapshot) => snapshot.resolve(&source_key(source), destination),
            None => Action::Deny,
        }
    }

    /// The currently published snapshot, if any.
    pub fn snapshot(&self) -> Option<Arc<PolicySnapshot>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Generation of the current policy; 0 before the first load.
    pub fn generation(&self) -> u64 {
        self.snapshot().map_or(0, |s| s.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regolith_config::{RawPolicy, WildcardRule};

    fn policy(default_action: Action, direct: &[(&str, Action)]) -> RawPolicy {
        RawPolicy {
            default_action,
            default_ports: vec![80],
            matches: direct
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            match_wildcard: Vec::new(),
        }
    }

    #[test]
    fn test_unloaded_engine_denies() {
        let engine = PermissionEngine::new();
        assert_eq!(engine.resolve("127.0.0.1", "example.com:80"), Action::Deny);
        assert_eq!(engine.generation(), 0);
        assert!(engine.snapshot().is_none());
    }

    #[test]
    fn test_global_only() {
        let mut set = PolicySet::new();
        set.insert(
            "$global",
            policy(Action::Deny, &[("example.com", Action::Accept)]),
        );
        let engine = PermissionEngine::from_policy(&set).unwrap();

        assert_eq!(engine.resolve("10.0.0.1", "example.com:80"), Action::Accept);
        assert_eq!(engine.resolve("10.0.0.1", "other.com:80"), Action::Deny);
        assert_eq!(engine.generation(), 1);
    }

    #[test]
    fn test_source_default_beats_global_default() {
        let mut set = PolicySet::new();
        set.insert("$global", policy(Action::Deny, &[]));
        set.insert("10.0.0.2", policy(Action::Ignore, &[]));
        let engine = PermissionEngine::from_policy(&set).unwrap();

        assert_eq!(engine.resolve("10.0.0.2", "x.com:80"), Action::Ignore);
        assert_eq!(engine.resolve("10.0.0.3", "x.com:80"), Action::Deny);
    }

    #[test]
    fn test_global_direct_beats_source_wildcard() {
        let mut source = policy(Action::Deny, &[]);
        source
            .match_wildcard
            .push(WildcardRule::new("*.example.com", Action::Accept));

        let mut set = PolicySet::new();
        set.insert(
            "$global",
            policy(Action::Accept, &[("ads.example.com", Action::Ignore)]),
        );
        set.insert("10.0.0.2", source);
        let engine = PermissionEngine::from_policy(&set).unwrap();

        assert_eq!(
            engine.resolve("10.0.0.2", "ads.example.com:80"),
            Action::Ignore
        );
        assert_eq!(
            engine.resolve("10.0.0.2", "www.example.com:80"),
            Action::Accept
        );
    }

    #[test]
    fn test_ipv6_source_keys() {
        let mut set = PolicySet::new();
        set.insert("[::1]", policy(Action::Accept, &[]));
        let engine = PermissionEngine::from_policy(&set).unwrap();

        assert_eq!(engine.resolve("::1", "example.com:80"), Action::Accept);
        // No global key: the global default is Deny
        assert_eq!(engine.resolve("::2", "example.com:80"), Action::Deny);
    }

    #[test]
    fn test_duplicate_global_rejected() {
        let mut set = PolicySet::new();
        set.insert("$global", policy(Action::Accept, &[]));
        set.insert("$GLOBAL", policy(Action::Deny, &[]));
        assert!(matches!(
            PolicySnapshot::compile(&set),
            Err(PolicyError::DuplicateGlobal { .. })
        ));
    }

    #[test]
    fn test_failed_load_keeps_previous_policy() {
        let mut good = PolicySet::new();
        good.insert("$global", policy(Action::Accept, &[]));
        let engine = PermissionEngine::from_policy(&good).unwrap();

        let mut bad = PolicySet::new();
        bad.insert("$global", policy(Action::Deny, &[]));
        bad.insert("$Global", policy(Action::Deny, &[]));
        assert!(engine.load(&bad).is_err());

        assert_eq!(engine.resolve("1.2.3.4", "example.com:80"), Action::Accept);
        assert_eq!(engine.generation(), 1);
    }

    #[test]
    fn test_load_replaces_everything() {
        let mut first = PolicySet::new();
        first.insert("10.0.0.9", policy(Action::Accept, &[]));
        let engine = PermissionEngine::from_policy(&first).unwrap();
        assert_eq!(engine.resolve("10.0.0.9", "a.com:80"), Action::Accept);

        let mut second = PolicySet::new();
        second.insert("$global", policy(Action::Ignore, &[]));
        assert_eq!(engine.load(&second).unwrap(), 2);

        // The old per-source entry is gone
        assert_eq!(engine.resolve("10.0.0.9", "a.com:80"), Action::Ignore);
    }
}
