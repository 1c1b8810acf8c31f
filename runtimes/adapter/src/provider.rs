use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use dop_shared::{ComponentConfig, Language, SecurityPolicy};
use std::sync::Arc;
use tracing::{debug, trace};

/// Native side of the adapter: actual enforcement, memory accounting and
/// interop for registered components. The adapter core never depends on
/// how a provider reaches its runtime.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn native_register(&self, config: &ComponentConfig) -> Result<()>;

    /// Runs before every call; an error refuses the call.
    async fn native_invoke(&self, component_id: &str, method: &str, policy: &SecurityPolicy) -> Result<()>;

    /// Bytes the provider attributes to the component.
    fn observed_memory(&self, component_id: &str) -> u64;

    async fn native_cleanup(&self, component_id: &str) -> Result<()>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

pub type ProviderFactory = Arc<dyn Fn() -> Result<Arc<dyn CapabilityProvider>> + Send + Sync>;

/// Setting in `language_specific_config` that reserves memory for a component.
pub const RESERVED_MEMORY_KEY: &str = "reserved_memory_bytes";

#[derive(Debug)]
struct ProviderSlot {
    language: Language,
    reserved_memory: u64,
    calls: u64,
}

/// Provider for components that live in this process.
#[derive(Debug, Default)]
pub struct InProcessProvider {
    slots: DashMap<String, ProviderSlot>,
}

impl InProcessProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> ProviderFactory {
        Arc::new(|| Ok(Arc::new(InProcessProvider::new()) as Arc<dyn CapabilityProvider>))
    }

    pub fn registered(&self) -> usize {
        self.slots.len()
    }

    pub fn calls(&self, component_id: &str) -> u64 {
        self.slots.get(component_id).map(|slot| slot.calls).unwrap_or(0)
    }
}

#[async_trait]
impl CapabilityProvider for InProcessProvider {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn native_register(&self, config: &ComponentConfig) -> Result<()> {
        let reserved_memory = match config.language_specific_config.get(RESERVED_MEMORY_KEY) {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| anyhow!("invalid {} '{}': {}", RESERVED_MEMORY_KEY, raw, e))?,
            None => 0,
        };

        if self.slots.contains_key(&config.component_id) {
            bail!("component {} already has a native slot", config.component_id);
        }

        self.slots.insert(
            config.component_id.clone(),
            ProviderSlot {
                language: config.language,
                reserved_memory,
                calls: 0,
            },
        );

        debug!(
            "Opened native slot for {} ({:?}, {} bytes reserved)",
            config.component_id, config.language, reserved_memory
        );
        Ok(())
    }

    async fn native_invoke(&self, component_id: &str, method: &str, policy: &SecurityPolicy) -> Result<()> {
        let mut slot = self
            .slots
            .get_mut(component_id)
            .ok_or_else(|| anyhow!("component {} has no native slot", component_id))?;

        if policy.stack_protection_enabled || policy.heap_protection_enabled {
            trace!(
                "Guarding {}.{} ({:?}) stack={} heap={}",
                component_id,
                method,
                slot.language,
                policy.stack_protection_enabled,
                policy.heap_protection_enabled
            );
        }

        slot.calls += 1;
        Ok(())
    }

    fn observed_memory(&self, component_id: &str) -> u64 {
        self.slots
            .get(component_id)
            .map(|slot| slot.reserved_memory)
            .unwrap_or(0)
    }

    async fn native_cleanup(&self, component_id: &str) -> Result<()> {
        match self.slots.remove(component_id) {
            Some(_) => {
                debug!("Released native slot for {}", component_id);
                Ok(())
            }
            None => Err(anyhow!("component {} has no native slot", component_id)),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let leaked = self.slots.len();
        self.slots.clear();
        if leaked > 0 {
            bail!("{} native slots were still open at shutdown", leaked);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dop_shared::IsolationLevel;

    fn config(id: &str) -> ComponentConfig {
        ComponentConfig::new(id, "Test", "1.0.0", Language::C)
    }

    #[tokio::test]
    async fn test_slot_lifecycle() {
        let provider = InProcessProvider::new();
        let policy = SecurityPolicy::new(IsolationLevel::Strict);

        provider.native_register(&config("a")).await.unwrap();
        assert!(provider.native_register(&config("a")).await.is_err());
        assert_eq!(provider.registered(), 1);

        provider.native_invoke("a", "run", &policy).await.unwrap();
        provider.native_invoke("a", "run", &policy).await.unwrap();
        assert_eq!(provider.calls("a"), 2);
        assert!(provider.native_invoke("b", "run", &policy).await.is_err());

        provider.native_cleanup("a").await.unwrap();
        assert!(provider.native_cleanup("a").await.is_err());
        provider.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reserved_memory_accounting() {
        let provider = InProcessProvider::new();
        provider
            .native_register(&config("big").with_setting(RESERVED_MEMORY_KEY, "4096"))
            .await
            .unwrap();
        assert_eq!(provider.observed_memory("big"), 4096);
        assert_eq!(provider.observed_memory("unknown"), 0);

        let bad = config("bad").with_setting(RESERVED_MEMORY_KEY, "lots");
        assert!(provider.native_register(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_reports_open_slots() {
        let provider = InProcessProvider::new();
        provider.native_register(&config("a")).await.unwrap();
        assert!(provider.shutdown().await.is_err());
        assert_eq!(provider.registered(), 0);
    }
}
