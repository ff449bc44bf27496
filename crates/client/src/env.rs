//! Process-wide client environment

use std::sync::Arc;

use veiltunnel_core::Config;

use crate::policy::{AccessPolicy, DefaultPolicy};
use crate::registry::Registry;

/// Configuration, access policy, and the registry of live tunnels,
/// shared by the listener and every tunnel driver.
pub struct Env {
    pub config: Config,
    pub registry: Registry,
    pub policy: Box<dyn AccessPolicy>,
}

impl Env {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_policy(config, Box::new(DefaultPolicy))
    }

    pub fn with_policy(config: Config, policy: Box<dyn AccessPolicy>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::new(),
            policy,
        })
    }

    /// Broadcast shutdown to every live tunnel.
    pub fn shutdown(&self) {
        self.registry.shutdown_all();
    }
}
