use crate::component::Component;
use crate::instance::ComponentInstance;
use crate::provider::CapabilityProvider;
use dop_shared::{AdapterError, ComponentConfig, ComponentState, Result, SecurityPolicy};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryMap {
    by_id: HashMap<String, Arc<Component>>,
    order: Vec<String>,
}

/// component_id -> Component, in registration order.
pub struct ComponentRegistry {
    components: RwLock<RegistryMap>,
    // Serializes register/unregister end to end, including their async hooks
    mutation: tokio::sync::Mutex<()>,
    capacity: Option<usize>,
}

impl ComponentRegistry {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            components: RwLock::new(RegistryMap::default()),
            mutation: tokio::sync::Mutex::new(()),
            capacity,
        }
    }

    pub async fn register(
        &self,
        config: ComponentConfig,
        instance: Arc<dyn ComponentInstance>,
        default_policy: &SecurityPolicy,
        provider: &dyn CapabilityProvider,
    ) -> Result<Arc<Component>> {
        let _guard = self.mutation.lock().await;

        config.validate()?;

        {
            let components = self.components.read();
            if components.by_id.contains_key(&config.component_id) {
                return Err(AdapterError::DuplicateComponent {
                    component_id: config.component_id.clone(),
                });
            }
            if let Some(capacity) = self.capacity {
                if components.by_id.len() >= capacity {
                    return Err(AdapterError::ResourceLimitExceeded {
                        component_id: config.component_id.clone(),
                        resource: "components".to_string(),
                        limit: capacity as u64,
                        observed: components.by_id.len() as u64 + 1,
                    });
                }
            }
        }

        let policy = config
            .security_policy
            .clone()
            .unwrap_or_else(|| default_policy.clone());
        let component = Arc::new(Component::new(config, policy, instance));
        component.transition(ComponentState::Initializing, "register")?;

        if let Some(missing) = component
            .config()
            .methods
            .iter()
            .find(|signature| !component.exports(&signature.name))
        {
            component.transition(ComponentState::Error, "register")?;
            return Err(AdapterError::MethodNotFound {
                component_id: component.id().to_string(),
                method: missing.name.clone(),
            });
        }

        if let Err(e) = provider.native_register(component.config()).await {
            component.transition(ComponentState::Error, "register")?;
            return Err(AdapterError::provider(e));
        }

        component.transition(ComponentState::Ready, "register")?;

        let mut components = self.components.write();
        components.order.push(component.id().to_string());
        components
            .by_id
            .insert(component.id().to_string(), component.clone());

        info!(
            "Registered component {} ({:?}, isolation {})",
            component.id(),
            component.config().language,
            component.policy().isolation_level
        );
        Ok(component)
    }

    /// Runs the cleanup hooks, then removes the component. On hook failure the
    /// component stays registered in ERROR.
    pub async fn unregister(&self, component_id: &str, provider: &dyn CapabilityProvider) -> Result<()> {
        let _guard = self.mutation.lock().await;

        let component = self.lookup(component_id)?;
        component.transition(ComponentState::Cleanup, "unregister")?;

        let instance_cleanup = component.instance().cleanup().await;
        let native_cleanup = match instance_cleanup {
            Ok(()) => provider.native_cleanup(component_id).await,
            Err(e) => Err(e),
        };

        if let Err(e) = native_cleanup {
            component.transition(ComponentState::Error, "unregister")?;
            warn!("Cleanup of {} failed: {:#}", component_id, e);
            return Err(AdapterError::Cleanup {
                component_id: component_id.to_string(),
                reason: format!("{:#}", e),
            });
        }

        component.transition(ComponentState::Destroyed, "unregister")?;
        self.remove(component_id)?;
        info!("Unregistered component {}", component_id);
        Ok(())
    }

    /// Removes a component whose cleanup failed. Hooks are still attempted
    /// but their failures are only logged.
    pub async fn force_unregister(&self, component_id: &str, provider: &dyn CapabilityProvider) -> Result<()> {
        let _guard = self.mutation.lock().await;

        let component = self.lookup(component_id)?;
        if component.state() == ComponentState::Executing {
            return Err(AdapterError::InvalidState {
                component_id: component_id.to_string(),
                state: ComponentState::Executing,
                operation: "force_unregister".to_string(),
            });
        }

        self.release(&component, provider).await;
        self.remove(component_id)?;
        info!("Force-unregistered component {}", component_id);
        Ok(())
    }

    /// Removes every component, tearing each down best-effort. Returns the
    /// ids whose hooks failed.
    pub async fn drain(&self, provider: &dyn CapabilityProvider) -> (usize, Vec<String>) {
        let _guard = self.mutation.lock().await;

        let drained: Vec<Arc<Component>> = {
            let mut components = self.components.write();
            let order = std::mem::take(&mut components.order);
            order
                .into_iter()
                .filter_map(|id| components.by_id.remove(&id))
                .collect()
        };

        let mut failures = Vec::new();
        for component in &drained {
            if !self.release(component, provider).await {
                failures.push(component.id().to_string());
            }
        }

        (drained.len(), failures)
    }

    async fn release(&self, component: &Component, provider: &dyn CapabilityProvider) -> bool {
        let mut clean = true;

        if component.transition(ComponentState::Cleanup, "cleanup").is_err() {
            debug!("Component {} torn down from {}", component.id(), component.state());
        }
        if let Err(e) = component.instance().cleanup().await {
            warn!("Instance cleanup of {} failed: {:#}", component.id(), e);
            clean = false;
        }
        if let Err(e) = provider.native_cleanup(component.id()).await {
            warn!("Native cleanup of {} failed: {:#}", component.id(), e);
            clean = false;
        }

        component.force_destroy();
        clean
    }

    fn lookup(&self, component_id: &str) -> Result<Arc<Component>> {
        self.get(component_id)
            .ok_or_else(|| AdapterError::ComponentNotFound {
                component_id: component_id.to_string(),
            })
    }

    fn remove(&self, component_id: &str) -> Result<()> {
        let mut components = self.components.write();
        let in_map = components.by_id.remove(component_id).is_some();
        let position = components.order.iter().position(|id| id == component_id);

        match (in_map, position) {
            (true, Some(index)) => {
                components.order.remove(index);
                Ok(())
            }
            _ => Err(AdapterError::Internal(format!(
                "registry index out of sync for {}",
                component_id
            ))),
        }
    }

    pub fn get(&self, component_id: &str) -> Option<Arc<Component>> {
        self.components.read().by_id.get(component_id).cloned()
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.components.read().order.clone()
    }

    pub fn components(&self) -> Vec<Arc<Component>> {
        let components = self.components.read();
        components
            .order
            .iter()
            .filter_map(|id| components.by_id.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.components.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
