use crc32fast::Hasher;
use sea_orm::IsolationLevel;
use serde::{Deserialize, Serialize};

/// Static configuration describing how a SeaORM model integrates with
/// the closure index.
#[derive(Clone, Debug)]
pub struct ClosureIndexConfig {
    entity_name: String,
    hierarchy_name: String,
    reparent_scope: ReparentScope,
    advisory_lock_strategy: AdvisoryLockStrategy,
    isolation: TransactionIsolation,
    transient_retries: u32,
}

impl ClosureIndexConfig {
    /// Create a new configuration using the logical entity and hierarchy names.
    pub fn new(entity_name: impl Into<String>, hierarchy_name: impl Into<String>) -> Self {
        let entity_name = entity_name.into();
        let hierarchy_name = hierarchy_name.into();

        let default_lock = AdvisoryLockStrategy::Namespaced(AdvisoryLockKey::derived_from(
            &entity_name,
            &hierarchy_name,
        ));

        Self {
            entity_name,
            hierarchy_name,
            reparent_scope: ReparentScope::default(),
            advisory_lock_strategy: default_lock,
            isolation: TransactionIsolation::default(),
            transient_retries: 0,
        }
    }

    /// Merge options produced by [`ClosureIndexOptions`].
    pub(crate) fn apply_options(mut self, options: ClosureIndexOptions) -> Self {
        if let Some(scope) = options.reparent_scope {
            self.reparent_scope = scope;
        }
        if let Some(strategy) = options.advisory_lock_strategy {
            self.advisory_lock_strategy = strategy;
        }
        if let Some(isolation) = options.isolation {
            self.isolation = isolation;
        }
        if let Some(retries) = options.transient_retries {
            self.transient_retries = retries;
        }
        self
    }

    /// Human-readable Rust struct name for the base entity.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Associated SeaORM entity name for the closure model.
    pub fn hierarchy_name(&self) -> &str {
        &self.hierarchy_name
    }

    /// Which entities follow a node when it is reparented.
    pub fn reparent_scope(&self) -> ReparentScope {
        self.reparent_scope
    }

    /// Advisory lock strategy (PostgreSQL only).
    pub fn advisory_lock_strategy(&self) -> &AdvisoryLockStrategy {
        &self.advisory_lock_strategy
    }

    /// Isolation level for mutation transactions (PostgreSQL only).
    pub fn isolation(&self) -> TransactionIsolation {
        self.isolation
    }

    /// How many times a mutation is re-run after a transient store error.
    pub fn transient_retries(&self) -> u32 {
        self.transient_retries
    }
}

/// Builder-style options consumed by the derive macro.
///
/// Also deserializable, so a service can keep overrides in its own config
/// file and merge them over the derived defaults:
///
/// ```
/// use closure_index::{ClosureIndexConfig, ClosureIndexOptions, ReparentScope};
///
/// let options = ClosureIndexOptions::from_json(r#"{ "reparent_scope": "node" }"#).unwrap();
/// let config = options.apply(ClosureIndexConfig::new("User", "UserClosure"));
/// assert_eq!(config.reparent_scope(), ReparentScope::Node);
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClosureIndexOptions {
    reparent_scope: Option<ReparentScope>,
    advisory_lock_strategy: Option<AdvisoryLockStrategy>,
    isolation: Option<TransactionIsolation>,
    transient_retries: Option<u32>,
}

impl ClosureIndexOptions {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn reparent_scope(mut self, scope: ReparentScope) -> Self {
        self.reparent_scope = Some(scope);
        self
    }

    pub fn advisory_lock_strategy(mut self, strategy: AdvisoryLockStrategy) -> Self {
        self.advisory_lock_strategy = Some(strategy);
        self
    }

    pub fn isolation(mut self, isolation: TransactionIsolation) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn transient_retries(mut self, retries: u32) -> Self {
        self.transient_retries = Some(retries);
        self
    }

    pub fn apply(self, base: ClosureIndexConfig) -> ClosureIndexConfig {
        base.apply_options(self)
    }
}

/// Which entities `reparent` retargets onto the new parent.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReparentScope {
    /// Every entity sharing the moved node's old parent is retargeted along
    /// with it. Roots have no siblings and always move alone.
    #[default]
    Siblings,
    /// Only the named node moves.
    Node,
}

/// Isolation level requested for mutation transactions.
///
/// The advisory lock is the first statement of a mutation. Under
/// `ReadCommitted` every later statement sees what the previous lock holder
/// committed. `RepeatableRead` and `Serializable` fix their snapshot at the
/// lock statement, so they only serialize overlapping mutations together
/// with [`AdvisoryLockStrategy::Disabled`] and `transient_retries > 0`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionIsolation {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl From<TransactionIsolation> for IsolationLevel {
    fn from(value: TransactionIsolation) -> Self {
        match value {
            TransactionIsolation::ReadCommitted => IsolationLevel::ReadCommitted,
            TransactionIsolation::RepeatableRead => IsolationLevel::RepeatableRead,
            TransactionIsolation::Serializable => IsolationLevel::Serializable,
        }
    }
}

/// Key used for PostgreSQL advisory locks.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdvisoryLockKey(String);

impl AdvisoryLockKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    fn derived_from(entity: &str, hierarchy: &str) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(entity.as_bytes());
        hasher.update(b"/");
        hasher.update(hierarchy.as_bytes());
        let crc = hasher.finalize();
        Self(format!("closure-index::{entity}::{hierarchy}::{crc:x}"))
    }
}

/// Configuration describing how to acquire advisory locks.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryLockStrategy {
    Disabled,
    Namespaced(AdvisoryLockKey),
}

impl AdvisoryLockStrategy {
    pub fn key(&self) -> Option<&AdvisoryLockKey> {
        match self {
            AdvisoryLockStrategy::Disabled => None,
            AdvisoryLockStrategy::Namespaced(key) => Some(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_lock_key_is_stable_per_model() {
        let a = ClosureIndexConfig::new("User", "UserClosure");
        let b = ClosureIndexConfig::new("User", "UserClosure");
        let c = ClosureIndexConfig::new("Team", "TeamClosure");

        let key_a = a.advisory_lock_strategy().key().map(AdvisoryLockKey::as_str);
        assert_eq!(key_a, b.advisory_lock_strategy().key().map(AdvisoryLockKey::as_str));
        assert_ne!(key_a, c.advisory_lock_strategy().key().map(AdvisoryLockKey::as_str));
        assert!(key_a.is_some_and(|key| key.starts_with("closure-index::User::UserClosure::")));
    }

    #[test]
    fn defaults_retarget_siblings_under_the_lock() {
        let config = ClosureIndexConfig::new("User", "UserClosure");
        assert_eq!(config.reparent_scope(), ReparentScope::Siblings);
        assert_eq!(config.isolation(), TransactionIsolation::ReadCommitted);
        assert!(config.advisory_lock_strategy().key().is_some());
        assert_eq!(config.transient_retries(), 0);
    }

    #[test]
    fn json_options_override_only_what_they_name() {
        let options = ClosureIndexOptions::from_json(
            r#"{
                "advisory_lock_strategy": "disabled",
                "isolation": "serializable",
                "transient_retries": 3
            }"#,
        )
        .unwrap();
        let config = ClosureIndexOptions::default()
            .reparent_scope(ReparentScope::Node)
            .apply(ClosureIndexConfig::new("User", "UserClosure"));
        let config = options.apply(config);

        assert_eq!(config.advisory_lock_strategy(), &AdvisoryLockStrategy::Disabled);
        assert_eq!(config.isolation(), TransactionIsolation::Serializable);
        assert_eq!(config.transient_retries(), 3);
        assert_eq!(config.reparent_scope(), ReparentScope::Node);
        assert_eq!(config.entity_name(), "User");
    }

    #[test]
    fn json_options_reject_unknown_keys() {
        assert!(ClosureIndexOptions::from_json(r#"{ "dependent": "destroy" }"#).is_err());
    }
}
