//! Instance registry
//!
//! Maps instance names to live records. Insertion is exclusive: a name
//! stays claimed until the instance is pruned. Mutations happen on the
//! executor thread; reads may come from anywhere.

use crate::error::{ModuleError, ModuleResult};
use crate::instance::Instance;
use dashmap::DashMap;
use std::sync::Arc;

pub(crate) struct InstanceRegistry {
    instances: DashMap<String, Arc<Instance>>,
}

impl InstanceRegistry {
    pub(crate) fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    /// Register an instance; its name must be unclaimed
    pub(crate) fn insert(&self, instance: Arc<Instance>) -> ModuleResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.instances.entry(instance.name().to_string()) {
            Entry::Occupied(_) => Err(ModuleError::DuplicateName(instance.name().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(instance);
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.instances.get(name).map(|entry| entry.value().clone())
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<Instance>> {
        self.instances.remove(name).map(|(_, instance)| instance)
    }

    /// Names of all registered instances
    pub(crate) fn names(&self) -> Vec<String> {
        self.instances
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Instances whose strong count dropped to zero
    pub(crate) fn prune_candidates(&self) -> Vec<String> {
        self.instances
            .iter()
            .filter(|entry| entry.value().strong_count() == 0)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.instances.len()
    }
}
