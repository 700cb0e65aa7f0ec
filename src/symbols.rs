//! Symbol and namespace index
//!
//! Maps `(namespace, name, version)` keys to their exporting instance and
//! keeps the namespace population counts. All mutations happen on the
//! executor thread during commit steps and unloads; reads may come from
//! anywhere.

use crate::declaration::Linkage;
use crate::error::{ModuleError, ModuleResult};
use crate::version::Version;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The implicit namespace every instance can see without an include
pub const GLOBAL_NAMESPACE: &str = "";

/// The erased value behind an exported symbol
///
/// Importers downcast to the concrete type agreed on by the module
/// interface.
pub type SymbolValue = Arc<dyn Any + Send + Sync>;

/// `(namespace, name)` pair identifying one symbol family
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolName {
    /// Namespace key; empty for the global namespace
    pub namespace: String,
    /// Symbol name
    pub name: String,
}

impl SymbolName {
    /// Convenience constructor
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SymbolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace == GLOBAL_NAMESPACE {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}::{}", self.namespace, self.name)
        }
    }
}

/// A published export: owner plus the exported value
#[derive(Clone)]
pub(crate) struct SymbolEntry {
    /// Name of the exporting instance
    pub owner: String,
    /// Global or unique linkage
    pub linkage: Linkage,
    /// The exported value
    pub value: SymbolValue,
}

/// The index: symbol map plus namespace population counts
pub(crate) struct SymbolIndex {
    symbols: DashMap<SymbolName, BTreeMap<Version, SymbolEntry>>,
    namespaces: DashMap<String, usize>,
}

impl SymbolIndex {
    pub(crate) fn new() -> Self {
        Self {
            symbols: DashMap::new(),
            namespaces: DashMap::new(),
        }
    }

    /// Insert an export; fails on an exact `(namespace, name, version)` conflict
    pub(crate) fn publish(
        &self,
        key: &SymbolName,
        version: Version,
        entry: SymbolEntry,
    ) -> ModuleResult<()> {
        let mut versions = self.symbols.entry(key.clone()).or_default();
        if versions.contains_key(&version) {
            return Err(ModuleError::DuplicateSymbol {
                name: key.name.clone(),
                namespace: key.namespace.clone(),
                version: version.to_string(),
            });
        }
        versions.insert(version, entry);
        drop(versions);
        *self.namespaces.entry(key.namespace.clone()).or_insert(0) += 1;
        Ok(())
    }

    /// Remove an export; the namespace entry disappears at population zero
    pub(crate) fn retract(&self, key: &SymbolName, version: &Version) -> Option<SymbolEntry> {
        let removed = {
            let mut versions = self.symbols.get_mut(key)?;
            let removed = versions.remove(version);
            if removed.is_some() && versions.is_empty() {
                drop(versions);
                self.symbols.remove(key);
            }
            removed
        };
        if removed.is_some() {
            let empty = match self.namespaces.get_mut(&key.namespace) {
                Some(mut population) => {
                    *population = population.saturating_sub(1);
                    *population == 0
                }
                None => false,
            };
            if empty {
                self.namespaces.remove(&key.namespace);
            }
        }
        removed
    }

    /// Remove every export owned by `owner`, returning the removed keys
    pub(crate) fn retract_all(&self, owner: &str) -> Vec<(SymbolName, Version)> {
        let owned: Vec<(SymbolName, Version)> = self
            .symbols
            .iter()
            .flat_map(|entry| {
                let key = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .filter(|(_, e)| e.owner == owner)
                    .map(|(v, _)| (key.clone(), *v))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (key, version) in &owned {
            self.retract(key, version);
        }
        owned
    }

    /// Find the best exporter for `key` at `min_version`
    ///
    /// Picks the highest exported version compatible under the subsystem
    /// rule; distinguishes an unknown symbol from a version mismatch.
    pub(crate) fn lookup(
        &self,
        key: &SymbolName,
        min_version: &Version,
    ) -> ModuleResult<(Version, SymbolEntry)> {
        let versions = self.symbols.get(key).ok_or_else(|| ModuleError::UnknownSymbol {
            name: key.name.clone(),
            namespace: key.namespace.clone(),
            version: min_version.to_string(),
        })?;
        let best = versions
            .iter()
            .rev()
            .find(|(v, _)| v.is_compatible_with(min_version));
        match best {
            Some((version, entry)) => Ok((*version, entry.clone())),
            None => {
                let highest = versions
                    .keys()
                    .next_back()
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                Err(ModuleError::VersionMismatch {
                    name: key.name.clone(),
                    exported: highest,
                    requested: min_version.to_string(),
                })
            }
        }
    }

    /// Like [`lookup`](Self::lookup), respecting linkage visibility
    ///
    /// Unique exports are visible only to their owning instance; pass the
    /// caller's name (or `None` for an outside observer).
    pub(crate) fn lookup_visible(
        &self,
        key: &SymbolName,
        min_version: &Version,
        caller: Option<&str>,
    ) -> ModuleResult<(Version, SymbolEntry)> {
        let (version, entry) = self.lookup(key, min_version)?;
        let visible = entry.linkage == Linkage::Global || caller == Some(entry.owner.as_str());
        if !visible {
            return Err(ModuleError::UnknownSymbol {
                name: key.name.clone(),
                namespace: key.namespace.clone(),
                version: min_version.to_string(),
            });
        }
        Ok((version, entry))
    }

    /// Whether an export exists under the exact `(namespace, name, version)` key
    pub(crate) fn contains_exact(&self, key: &SymbolName, version: &Version) -> bool {
        self.symbols
            .get(key)
            .map(|versions| versions.contains_key(version))
            .unwrap_or(false)
    }

    /// Whether any live export populates `namespace`
    pub(crate) fn namespace_exists(&self, namespace: &str) -> bool {
        namespace == GLOBAL_NAMESPACE || self.namespaces.contains_key(namespace)
    }

    /// Live export count in `namespace`
    pub(crate) fn namespace_population(&self, namespace: &str) -> usize {
        self.namespaces
            .get(namespace)
            .map(|entry| *entry)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(owner: &str) -> SymbolEntry {
        SymbolEntry {
            owner: owner.to_string(),
            linkage: Linkage::Global,
            value: Arc::new(7u32),
        }
    }

    #[test]
    fn publish_and_lookup() {
        let index = SymbolIndex::new();
        let key = SymbolName::new("gfx", "draw");
        index.publish(&key, Version::new(1, 2, 0), entry("gfx-core")).unwrap();

        let (version, found) = index.lookup(&key, &Version::new(1, 0, 0)).unwrap();
        assert_eq!(version, Version::new(1, 2, 0));
        assert_eq!(found.owner, "gfx-core");
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let index = SymbolIndex::new();
        let key = SymbolName::new("gfx", "draw");
        index.publish(&key, Version::new(1, 0, 0), entry("a")).unwrap();
        assert!(matches!(
            index.publish(&key, Version::new(1, 0, 0), entry("b")),
            Err(ModuleError::DuplicateSymbol { .. })
        ));
        // A different version under the same name is fine.
        index.publish(&key, Version::new(1, 1, 0), entry("b")).unwrap();
    }

    #[test]
    fn lookup_prefers_highest_compatible() {
        let index = SymbolIndex::new();
        let key = SymbolName::new("", "alloc");
        index.publish(&key, Version::new(1, 1, 0), entry("a")).unwrap();
        index.publish(&key, Version::new(1, 3, 0), entry("b")).unwrap();
        index.publish(&key, Version::new(2, 0, 0), entry("c")).unwrap();

        let (version, found) = index.lookup(&key, &Version::new(1, 2, 0)).unwrap();
        assert_eq!(version, Version::new(1, 3, 0));
        assert_eq!(found.owner, "b");
    }

    #[test]
    fn version_mismatch_is_distinguished_from_unknown() {
        let index = SymbolIndex::new();
        let key = SymbolName::new("gfx", "draw");
        index.publish(&key, Version::new(1, 0, 0), entry("a")).unwrap();

        assert!(matches!(
            index.lookup(&key, &Version::new(2, 0, 0)),
            Err(ModuleError::VersionMismatch { .. })
        ));
        assert!(matches!(
            index.lookup(&SymbolName::new("gfx", "blit"), &Version::new(1, 0, 0)),
            Err(ModuleError::UnknownSymbol { .. })
        ));
    }

    #[test]
    fn namespace_population_tracks_publishes() {
        let index = SymbolIndex::new();
        let draw = SymbolName::new("gfx", "draw");
        let blit = SymbolName::new("gfx", "blit");
        index.publish(&draw, Version::new(1, 0, 0), entry("a")).unwrap();
        index.publish(&blit, Version::new(1, 0, 0), entry("a")).unwrap();
        assert_eq!(index.namespace_population("gfx"), 2);

        index.retract(&draw, &Version::new(1, 0, 0));
        assert!(index.namespace_exists("gfx"));
        index.retract(&blit, &Version::new(1, 0, 0));
        assert!(!index.namespace_exists("gfx"));
    }

    #[test]
    fn retract_all_removes_only_the_owner() {
        let index = SymbolIndex::new();
        index
            .publish(&SymbolName::new("gfx", "draw"), Version::new(1, 0, 0), entry("a"))
            .unwrap();
        index
            .publish(&SymbolName::new("gfx", "blit"), Version::new(1, 0, 0), entry("b"))
            .unwrap();

        let removed = index.retract_all("a");
        assert_eq!(removed.len(), 1);
        assert!(index
            .lookup(&SymbolName::new("gfx", "blit"), &Version::new(1, 0, 0))
            .is_ok());
    }

    #[test]
    fn global_namespace_always_exists() {
        let index = SymbolIndex::new();
        assert!(index.namespace_exists(GLOBAL_NAMESPACE));
    }
}
