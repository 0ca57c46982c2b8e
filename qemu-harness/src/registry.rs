use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    error::{HarnessError, Result},
    instance::{Instance, InstanceId},
};

/// Every instance started during one run, live or dead.
///
/// Entries are never removed, so an id cannot be reused until the whole
/// registry is replaced.
#[derive(Default)]
pub struct Registry {
    instances: Mutex<BTreeMap<InstanceId, Arc<Instance>>>,
}

impl Registry {
    /// Creates and registers a fresh instance for `id`.
    pub(crate) fn register(&self, id: InstanceId) -> Result<Arc<Instance>> {
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        if instances.contains_key(&id) {
            return Err(HarnessError::InstanceExists { id });
        }
        let instance = Instance::new(id);
        instances.insert(id, instance.clone());
        Ok(instance)
    }

    pub fn get(&self, id: InstanceId) -> Result<Arc<Instance>> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(HarnessError::UnknownInstance { id })
    }

    pub fn all(&self) -> Vec<Arc<Instance>> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::KillReason;
    use pretty_assertions::assert_eq;

    #[test]
    fn ids_are_not_reused_after_kill() {
        let registry = Registry::default();
        let first = registry.register(InstanceId(0)).unwrap();
        first.kill(KillReason::Shutdown);
        assert!(matches!(
            registry.register(InstanceId(0)),
            Err(HarnessError::InstanceExists { id: InstanceId(0) })
        ));
    }

    #[test]
    fn lookup_of_unknown_id_fails() {
        let registry = Registry::default();
        registry.register(InstanceId(2)).unwrap();
        registry.register(InstanceId(0)).unwrap();
        assert!(matches!(
            registry.get(InstanceId(1)),
            Err(HarnessError::UnknownInstance { id: InstanceId(1) })
        ));
        assert_eq!(registry.ids(), vec![InstanceId(0), InstanceId(2)]);
    }
}
