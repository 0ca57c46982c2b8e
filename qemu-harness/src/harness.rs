use std::sync::Arc;

use tracing::info;

use crate::{
    config::HarnessConfig,
    error::Result,
    instance::{Instance, InstanceId, Pipes},
    registry::Registry,
    watchdog,
};

/// Entry point for test code: owns the configuration and every instance
/// started during one run.
///
/// Independent runs use independent `Harness` values; nothing is global.
pub struct Harness {
    config: HarnessConfig,
    registry: Registry,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            registry: Registry::default(),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn instance(&self, id: InstanceId) -> Result<Arc<Instance>> {
        self.registry.get(id)
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.registry.ids()
    }

    /// `false` for unknown ids as well as dead ones.
    pub fn is_running(&self, id: InstanceId) -> bool {
        self.instance(id).is_ok_and(|i| i.is_running())
    }

    pub fn last_line(&self, id: InstanceId) -> Option<String> {
        self.instance(id).ok().and_then(|i| i.last_line())
    }

    /// Registers a guest whose pipes were opened elsewhere and starts its
    /// watchdog. No exit watcher is attached; `pid`, if given, is what
    /// [`Harness::kill`] interrupts.
    pub fn attach(&self, id: InstanceId, pipes: Pipes, pid: Option<u32>) -> Result<()> {
        let instance = self.registry.register(id)?;
        instance.set_pid(pid);
        instance.install_pipes(pipes)?;
        watchdog::spawn(instance.clone(), self.config.watchdog_interval());
        info!(instance = %instance.id(), ?pid, "instance attached");
        Ok(())
    }
}
