use crate::component::{ComponentHandle, ComponentStats};
use crate::config::AdapterConfig;
use crate::events::{now_ms, AdapterEvent, EventBus, EventKind, ListenerId};
use crate::instance::ComponentInstance;
use crate::invocation::{InvocationEngine, InvocationReport, InvokeOptions};
use crate::provider::{CapabilityProvider, InProcessProvider, ProviderFactory};
use crate::registry::ComponentRegistry;
use dop_shared::{AdapterError, ComponentConfig, ComponentState, IsolationLevel, Result, SecurityPolicy, TaggedValue};
use metrics::Gauge;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// State that lives between `initialize` and `cleanup`.
struct AdapterContext {
    adapter_id: Uuid,
    default_policy: SecurityPolicy,
    registry: ComponentRegistry,
    provider: Arc<dyn CapabilityProvider>,
    engine: InvocationEngine,
    started_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterStats {
    pub adapter_id: Uuid,
    pub provider: String,
    pub default_isolation: IsolationLevel,
    pub registered_components: usize,
    pub components_by_state: BTreeMap<String, usize>,
    pub total_invocations: u64,
    pub successful_invocations: u64,
    pub failed_invocations: u64,
    pub denied_invocations: u64,
    pub timeouts: u64,
    pub security_violations: u64,
    pub total_execution_ms: f64,
    pub average_execution_ms: f64,
    pub uptime_ms: u64,
}

/// Entry point for embedders. One instance owns one registry and one
/// capability provider; independent instances share nothing.
pub struct DopAdapter {
    events: Arc<EventBus>,
    context: RwLock<Option<Arc<AdapterContext>>>,
    provider_factory: ProviderFactory,
    registered: Gauge,
}

impl Default for DopAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DopAdapter {
    pub fn new() -> Self {
        Self::with_provider_factory(InProcessProvider::factory())
    }

    /// The factory runs once per `initialize`.
    pub fn with_provider_factory(provider_factory: ProviderFactory) -> Self {
        Self {
            events: Arc::new(EventBus::new()),
            context: RwLock::new(None),
            provider_factory,
            registered: metrics::gauge!("dop_registered_components"),
        }
    }

    pub fn initialize(&self, config: Option<AdapterConfig>) -> Result<()> {
        let config = config.unwrap_or_default();

        let (adapter_id, isolation_level) = {
            let mut slot = self.context.write();
            if slot.is_some() {
                return Err(AdapterError::AlreadyInitialized);
            }

            let provider = (self.provider_factory)().map_err(AdapterError::provider)?;
            let context = AdapterContext {
                adapter_id: Uuid::new_v4(),
                default_policy: config.merged_policy(),
                registry: ComponentRegistry::new(config.max_components),
                engine: InvocationEngine::new(self.events.clone(), provider.clone()),
                provider,
                started_at: Instant::now(),
            };

            info!(
                "Initialized adapter {} (isolation {}, provider {})",
                context.adapter_id,
                config.default_isolation,
                context.provider.name()
            );
            let ids = (context.adapter_id, config.default_isolation);
            *slot = Some(Arc::new(context));
            ids
        };

        self.registered.set(0.0);
        self.events.emit(AdapterEvent::Initialized {
            adapter_id,
            isolation_level,
            timestamp_ms: now_ms(),
        });
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.context.read().is_some()
    }

    fn context(&self) -> Result<Arc<AdapterContext>> {
        self.context.read().clone().ok_or(AdapterError::NotInitialized)
    }

    /// Internal errors mean the registry can no longer be trusted; the
    /// context is dropped so the next call reports NotInitialized.
    fn escalate(&self, err: AdapterError) -> AdapterError {
        if err.is_fatal() {
            error!("Adapter context abandoned: {}", err);
            self.context.write().take();
            self.registered.set(0.0);
        }
        err
    }

    pub async fn register_component(
        &self,
        config: ComponentConfig,
        instance: Arc<dyn ComponentInstance>,
    ) -> Result<ComponentHandle> {
        let context = self.context()?;
        let component = context
            .registry
            .register(config, instance, &context.default_policy, context.provider.as_ref())
            .await
            .map_err(|e| self.escalate(e))?;

        self.registered.set(context.registry.len() as f64);
        self.events.emit(AdapterEvent::ComponentRegistered {
            component_id: component.id().to_string(),
            component_name: component.config().component_name.clone(),
            language: component.config().language,
            timestamp_ms: now_ms(),
        });
        Ok(ComponentHandle::new(component))
    }

    pub async fn unregister_component(&self, component_id: &str) -> Result<()> {
        let context = self.context()?;
        context
            .registry
            .unregister(component_id, context.provider.as_ref())
            .await
            .map_err(|e| self.escalate(e))?;

        self.unregistered(&context, component_id, false);
        Ok(())
    }

    /// Removes a component even when its cleanup hooks fail. Refused while
    /// the component is executing.
    pub async fn force_unregister_component(&self, component_id: &str) -> Result<()> {
        let context = self.context()?;
        context
            .registry
            .force_unregister(component_id, context.provider.as_ref())
            .await
            .map_err(|e| self.escalate(e))?;

        self.unregistered(&context, component_id, true);
        Ok(())
    }

    fn unregistered(&self, context: &AdapterContext, component_id: &str, forced: bool) {
        self.registered.set(context.registry.len() as f64);
        self.events.emit(AdapterEvent::ComponentUnregistered {
            component_id: component_id.to_string(),
            forced,
            timestamp_ms: now_ms(),
        });
    }

    pub async fn invoke(
        &self,
        component_id: &str,
        method: &str,
        params: Vec<TaggedValue>,
        options: InvokeOptions,
    ) -> Result<TaggedValue> {
        self.invoke_detailed(component_id, method, params, options)
            .await
            .map(|report| report.value)
    }

    /// Like `invoke`, but also returns timing, memory and compliance details.
    pub async fn invoke_detailed(
        &self,
        component_id: &str,
        method: &str,
        params: Vec<TaggedValue>,
        options: InvokeOptions,
    ) -> Result<InvocationReport> {
        let context = self.context()?;
        context
            .engine
            .invoke(&context.registry, component_id, method, params, &options)
            .await
            .map_err(|e| self.escalate(e))
    }

    pub fn suspend_component(&self, component_id: &str) -> Result<()> {
        let context = self.context()?;
        let component = context
            .registry
            .get(component_id)
            .ok_or_else(|| AdapterError::ComponentNotFound {
                component_id: component_id.to_string(),
            })?;

        // Only READY may be suspended
        component.transition(ComponentState::Suspended, "suspend")?;

        info!("Suspended component {}", component_id);
        self.events.emit(AdapterEvent::ComponentSuspended {
            component_id: component_id.to_string(),
            timestamp_ms: now_ms(),
        });
        Ok(())
    }

    pub fn resume_component(&self, component_id: &str) -> Result<()> {
        let context = self.context()?;
        let component = context
            .registry
            .get(component_id)
            .ok_or_else(|| AdapterError::ComponentNotFound {
                component_id: component_id.to_string(),
            })?;

        // READY is also reachable from INITIALIZING and EXECUTING, so check the source
        match component.state() {
            ComponentState::Suspended => {}
            state => {
                return Err(AdapterError::InvalidState {
                    component_id: component_id.to_string(),
                    state,
                    operation: "resume".to_string(),
                })
            }
        }
        component.transition(ComponentState::Ready, "resume")?;

        info!("Resumed component {}", component_id);
        self.events.emit(AdapterEvent::ComponentResumed {
            component_id: component_id.to_string(),
            timestamp_ms: now_ms(),
        });
        Ok(())
    }

    pub fn get_component(&self, component_id: &str) -> Option<ComponentHandle> {
        let context = self.context().ok()?;
        context.registry.get(component_id).map(ComponentHandle::new)
    }

    /// Registered ids in registration order.
    pub fn list_components(&self) -> Vec<String> {
        self.context()
            .map(|context| context.registry.list_ids())
            .unwrap_or_default()
    }

    pub fn get_component_statistics(&self, component_id: &str) -> Result<ComponentStats> {
        let context = self.context()?;
        context
            .registry
            .get(component_id)
            .map(|component| component.stats())
            .ok_or_else(|| AdapterError::ComponentNotFound {
                component_id: component_id.to_string(),
            })
    }

    pub fn get_statistics(&self) -> Result<AdapterStats> {
        let context = self.context()?;
        let counters = context.engine.counters();

        let components = context.registry.components();
        let mut components_by_state = BTreeMap::new();
        for component in &components {
            *components_by_state.entry(component.state().to_string()).or_insert(0) += 1;
        }

        let total_execution_ms = counters.total_execution_us as f64 / 1000.0;
        let average_execution_ms = if counters.total > 0 {
            total_execution_ms / counters.total as f64
        } else {
            0.0
        };

        Ok(AdapterStats {
            adapter_id: context.adapter_id,
            provider: context.provider.name().to_string(),
            default_isolation: context.default_policy.isolation_level,
            registered_components: components.len(),
            components_by_state,
            total_invocations: counters.total,
            successful_invocations: counters.successful,
            failed_invocations: counters.failed,
            denied_invocations: counters.denied,
            timeouts: counters.timeouts,
            security_violations: counters.security_violations,
            total_execution_ms,
            average_execution_ms,
            uptime_ms: context.started_at.elapsed().as_millis() as u64,
        })
    }

    /// Tears down every component, then the provider. Individual failures
    /// are logged and counted; afterwards `initialize` may be called again.
    pub async fn cleanup(&self) -> Result<()> {
        let context = self.context.write().take().ok_or(AdapterError::NotInitialized)?;

        let (released, failures) = context.registry.drain(context.provider.as_ref()).await;
        for component_id in &failures {
            warn!("Component {} did not clean up cleanly", component_id);
        }
        if let Err(e) = context.provider.shutdown().await {
            warn!("Provider {} shutdown failed: {:#}", context.provider.name(), e);
        }

        self.registered.set(0.0);
        info!(
            "Adapter {} cleaned up ({} components, {} failures)",
            context.adapter_id,
            released,
            failures.len()
        );
        self.events.emit(AdapterEvent::Cleanup {
            adapter_id: context.adapter_id,
            components_released: released,
            cleanup_failures: failures.len(),
            timestamp_ms: now_ms(),
        });
        Ok(())
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&AdapterEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, Arc::new(listener))
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.events.unsubscribe(kind, id)
    }
}
