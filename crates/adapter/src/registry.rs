//! Platform → adapter selection.
//!
//! The set of platforms is closed; each maps to one adapter instance.
//! Deployments that ship real platform hosts register them here; the
//! defaults give every meeting platform the scripted simulator (local
//! development) and RTMS its real ingest client.

use std::collections::HashMap;
use std::sync::Arc;

use qm_domain::platform::Platform;
use qm_domain::{Error, Result};

use crate::rtms::RtmsAdapter;
use crate::sim::{SimAdapter, SimScript};
use crate::BotAdapter;

pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn BotAdapter>>,
}

impl AdapterRegistry {
    /// Simulator for the meeting platforms, real RTMS ingest.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        let sim: Arc<dyn BotAdapter> = Arc::new(SimAdapter::new(SimScript::happy_path(2, 30_000)));
        for platform in [
            Platform::ZoomNative,
            Platform::ZoomWeb,
            Platform::GoogleMeet,
            Platform::Teams,
        ] {
            registry.adapters.insert(platform, sim.clone());
        }
        registry
            .adapters
            .insert(Platform::ZoomRtms, Arc::new(RtmsAdapter::new()));
        registry
    }

    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register (or replace) the adapter for a platform.
    pub fn register(&mut self, platform: Platform, adapter: Arc<dyn BotAdapter>) {
        self.adapters.insert(platform, adapter);
    }

    pub fn get(&self, platform: Platform) -> Result<Arc<dyn BotAdapter>> {
        self.adapters
            .get(&platform)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no adapter registered for {platform}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_platform() {
        let registry = AdapterRegistry::with_defaults();
        for platform in [
            Platform::ZoomNative,
            Platform::ZoomWeb,
            Platform::GoogleMeet,
            Platform::Teams,
            Platform::ZoomRtms,
        ] {
            assert!(registry.get(platform).is_ok(), "{platform} missing");
        }
        assert_eq!(registry.get(Platform::ZoomRtms).unwrap().kind(), "rtms");
        assert_eq!(registry.get(Platform::GoogleMeet).unwrap().kind(), "sim");
    }

    #[test]
    fn register_replaces() {
        let mut registry = AdapterRegistry::empty();
        assert!(registry.get(Platform::Teams).is_err());
        registry.register(
            Platform::Teams,
            Arc::new(SimAdapter::new(SimScript::new())),
        );
        assert!(registry.get(Platform::Teams).is_ok());
    }
}
