use crate::instance::ComponentInstance;
use dop_shared::{
    AdapterError, ComponentConfig, ComponentState, Language, MethodSignature, Result, SecurityPolicy,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentStats {
    pub invocation_count: u64,
    pub successful_invocations: u64,
    pub failed_invocations: u64,
    /// Calls refused before reaching the instance.
    pub rejected_invocations: u64,
    pub total_execution_ms: f64,
    pub average_execution_ms: f64,
    pub last_execution_ms: f64,
    pub memory_high_water: u64,
    pub security_violations: u64,
}

#[derive(Debug)]
struct RuntimeState {
    state: ComponentState,
    stats: ComponentStats,
}

/// Registered component. Owned by the registry; state and statistics live
/// behind a per-component lock.
pub struct Component {
    config: ComponentConfig,
    policy: SecurityPolicy,
    instance: Arc<dyn ComponentInstance>,
    exported: HashSet<String>,
    runtime: Mutex<RuntimeState>,
}

impl Component {
    pub(crate) fn new(config: ComponentConfig, policy: SecurityPolicy, instance: Arc<dyn ComponentInstance>) -> Self {
        let exported = instance.exported_methods().into_iter().collect();

        Self {
            config,
            policy,
            instance,
            exported,
            runtime: Mutex::new(RuntimeState {
                state: ComponentState::Uninitialized,
                stats: ComponentStats::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.component_id
    }

    pub fn config(&self) -> &ComponentConfig {
        &self.config
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub(crate) fn instance(&self) -> &Arc<dyn ComponentInstance> {
        &self.instance
    }

    pub fn exports(&self, method: &str) -> bool {
        self.exported.contains(method)
    }

    /// Declared signature for `method`, if any.
    pub fn signature(&self, method: &str) -> Option<&MethodSignature> {
        self.config.method(method)
    }

    pub fn state(&self) -> ComponentState {
        self.runtime.lock().state
    }

    pub fn stats(&self) -> ComponentStats {
        self.runtime.lock().stats.clone()
    }

    /// Moves to `next`, returning the previous state.
    pub(crate) fn transition(&self, next: ComponentState, operation: &str) -> Result<ComponentState> {
        let mut runtime = self.runtime.lock();
        let current = runtime.state;

        if !current.can_transition_to(next) {
            return Err(AdapterError::InvalidState {
                component_id: self.id().to_string(),
                state: current,
                operation: operation.to_string(),
            });
        }

        runtime.state = next;
        debug!("Component {} {} -> {}", self.id(), current, next);
        Ok(current)
    }

    /// READY -> EXECUTING. A busy component fails fast.
    pub(crate) fn begin_invocation(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.state != ComponentState::Ready {
            runtime.stats.rejected_invocations += 1;
            return Err(AdapterError::InvalidState {
                component_id: self.id().to_string(),
                state: runtime.state,
                operation: "invoke".to_string(),
            });
        }
        runtime.state = ComponentState::Executing;
        Ok(())
    }

    /// EXECUTING -> READY or ERROR, with statistics updated in the same
    /// critical section.
    pub(crate) fn finish_invocation(&self, success: bool, elapsed: Duration, observed_memory: u64) {
        let mut runtime = self.runtime.lock();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        let stats = &mut runtime.stats;
        stats.invocation_count += 1;
        if success {
            stats.successful_invocations += 1;
        } else {
            stats.failed_invocations += 1;
        }
        stats.total_execution_ms += elapsed_ms;
        stats.average_execution_ms = stats.total_execution_ms / stats.invocation_count as f64;
        stats.last_execution_ms = elapsed_ms;
        stats.memory_high_water = stats.memory_high_water.max(observed_memory);

        if runtime.state == ComponentState::Executing {
            runtime.state = if success {
                ComponentState::Ready
            } else {
                ComponentState::Error
            };
        } else {
            // Torn down by a forced cleanup while the call was outstanding
            warn!(
                "Component {} left EXECUTING while a call was in flight (now {})",
                self.id(),
                runtime.state
            );
        }
    }

    /// EXECUTING -> READY for a call that never reached the instance.
    pub(crate) fn abandon_invocation(&self) {
        let mut runtime = self.runtime.lock();
        runtime.stats.rejected_invocations += 1;
        if runtime.state == ComponentState::Executing {
            runtime.state = ComponentState::Ready;
        }
    }

    pub(crate) fn record_rejection(&self, violation: bool) {
        let mut runtime = self.runtime.lock();
        runtime.stats.rejected_invocations += 1;
        if violation {
            runtime.stats.security_violations += 1;
        }
    }

    pub(crate) fn record_violation(&self) {
        self.runtime.lock().stats.security_violations += 1;
    }

    /// Ends in DESTROYED regardless of the current state.
    pub(crate) fn force_destroy(&self) -> ComponentState {
        let mut runtime = self.runtime.lock();
        let previous = runtime.state;
        runtime.state = ComponentState::Destroyed;
        previous
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("id", &self.id())
            .field("language", &self.config.language)
            .field("state", &self.state())
            .finish()
    }
}

/// Cheap, cloneable view of a registered component.
#[derive(Clone)]
pub struct ComponentHandle {
    component: Arc<Component>,
}

impl ComponentHandle {
    pub(crate) fn new(component: Arc<Component>) -> Self {
        Self { component }
    }

    pub fn id(&self) -> &str {
        self.component.id()
    }

    pub fn name(&self) -> &str {
        &self.component.config().component_name
    }

    pub fn version(&self) -> &str {
        &self.component.config().version
    }

    pub fn language(&self) -> Language {
        self.component.config().language
    }

    pub fn config(&self) -> &ComponentConfig {
        self.component.config()
    }

    pub fn policy(&self) -> &SecurityPolicy {
        self.component.policy()
    }

    pub fn state(&self) -> ComponentState {
        self.component.state()
    }

    pub fn stats(&self) -> ComponentStats {
        self.component.stats()
    }
}

impl std::fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
