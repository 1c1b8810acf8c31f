use crate::component::Component;
use crate::events::{now_ms, AdapterEvent, EventBus, InvocationRecord, InvocationStatus, ViolationDetail};
use crate::provider::CapabilityProvider;
use crate::registry::ComponentRegistry;
use dop_shared::{
    check_resource_limits, first_missing_permission, AdapterError, ComplianceResult, ComponentState,
    ResourceViolation, Result, TaggedValue,
};
use metrics::{Counter, Histogram};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokeOptions {
    /// Per-call ceiling; the tighter of this, the method's and the policy's limit applies.
    pub timeout_ms: Option<u64>,
    /// Fail the call when the memory ceiling is exceeded instead of only reporting it.
    pub strict_limits: bool,
}

impl InvokeOptions {
    pub fn with_timeout_ms(timeout_ms: u64) -> Self {
        Self {
            timeout_ms: Some(timeout_ms),
            ..Self::default()
        }
    }

    pub fn strict() -> Self {
        Self {
            strict_limits: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationReport {
    pub value: TaggedValue,
    pub elapsed: Duration,
    pub observed_memory: u64,
    pub compliance: ComplianceResult,
}

/// Adapter-wide invocation counters, readable without pausing callers.
#[derive(Debug, Default)]
pub struct InvocationCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    denied: AtomicU64,
    timeouts: AtomicU64,
    security_violations: AtomicU64,
    total_execution_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub denied: u64,
    pub timeouts: u64,
    pub security_violations: u64,
    pub total_execution_us: u64,
}

impl InvocationCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            security_violations: self.security_violations.load(Ordering::Relaxed),
            total_execution_us: self.total_execution_us.load(Ordering::Relaxed),
        }
    }
}

struct InvocationMetrics {
    total: Counter,
    failed: Counter,
    duration: Histogram,
    violations: Counter,
}

/// Runs calls against registered components: admission, permission checks,
/// timed execution, compliance and bookkeeping.
pub struct InvocationEngine {
    events: Arc<EventBus>,
    provider: Arc<dyn CapabilityProvider>,
    counters: InvocationCounters,
    metrics: InvocationMetrics,
}

impl InvocationEngine {
    pub fn new(events: Arc<EventBus>, provider: Arc<dyn CapabilityProvider>) -> Self {
        Self {
            events,
            provider,
            counters: InvocationCounters::default(),
            metrics: InvocationMetrics {
                total: metrics::counter!("dop_invocations_total"),
                failed: metrics::counter!("dop_invocations_failed"),
                duration: metrics::histogram!("dop_invocation_duration_ms"),
                violations: metrics::counter!("dop_security_violations_total"),
            },
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub async fn invoke(
        &self,
        registry: &ComponentRegistry,
        component_id: &str,
        method: &str,
        params: Vec<TaggedValue>,
        options: &InvokeOptions,
    ) -> Result<InvocationReport> {
        let started = Instant::now();
        let outcome = self.run(registry, component_id, method, params, options).await;
        self.record(component_id, method, started.elapsed(), &outcome);
        outcome
    }

    async fn run(
        &self,
        registry: &ComponentRegistry,
        component_id: &str,
        method: &str,
        params: Vec<TaggedValue>,
        options: &InvokeOptions,
    ) -> Result<InvocationReport> {
        let component = registry
            .get(component_id)
            .ok_or_else(|| AdapterError::ComponentNotFound {
                component_id: component_id.to_string(),
            })?;

        self.admit(&component, method, &params)?;

        let policy = component.policy();
        let signature = component.signature(method);
        let mut limit_ms = policy.max_execution_time_ms;
        if let Some(method_limit) = signature.and_then(|s| s.max_execution_time_ms) {
            limit_ms = limit_ms.min(method_limit);
        }
        if let Some(call_limit) = options.timeout_ms {
            limit_ms = limit_ms.min(call_limit);
        }

        component.begin_invocation()?;
        let mut in_flight = InFlight {
            engine: self,
            component: component.as_ref(),
            method,
            started: Instant::now(),
            dispatched: false,
            settled: false,
        };

        // Only the caller that won READY -> EXECUTING reaches the provider
        if let Err(e) = self.provider.native_invoke(component_id, method, policy).await {
            in_flight.settle();
            component.abandon_invocation();
            return Err(AdapterError::provider(e));
        }
        in_flight.dispatched = true;
        debug!("Invoking {}.{} (limit {}ms)", component_id, method, limit_ms);

        let input_footprint: u64 = params.iter().map(TaggedValue::footprint).sum();
        let started = Instant::now();
        let call = timeout(Duration::from_millis(limit_ms), component.instance().call(method, params)).await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        let timed_out = AdapterError::Timeout {
            component_id: component_id.to_string(),
            method: method.to_string(),
            limit_ms,
            elapsed_ms,
        };
        let result = match call {
            Err(_) => Err(timed_out),
            Ok(Err(e)) => Err(AdapterError::Execution {
                component_id: component_id.to_string(),
                method: method.to_string(),
                message: format!("{:#}", e),
            }),
            // Uninterruptible callee that overran its budget
            Ok(Ok(_)) if elapsed_ms > limit_ms => Err(timed_out),
            Ok(Ok(value)) => match signature {
                Some(sig) if !sig.return_type.accepts(value.value_type()) => Err(AdapterError::Marshal {
                    expected: sig.return_type.to_string(),
                    found: value.value_type().to_string(),
                }),
                _ => Ok(value),
            },
        };

        let output_footprint = result.as_ref().map(TaggedValue::footprint).unwrap_or(0);
        let observed_memory = input_footprint
            + output_footprint
            + component.instance().memory_usage()
            + self.provider.observed_memory(component_id);
        let compliance = check_resource_limits(policy, observed_memory, elapsed_ms);

        if let Err(AdapterError::Timeout { .. }) = &result {
            self.violation(
                &component,
                method,
                ViolationDetail::Resource(ResourceViolation::ExecutionTime {
                    limit_ms,
                    observed_ms: elapsed_ms,
                }),
            );
        }

        let mut result = result;
        if let Some(memory) = compliance.memory_violation() {
            self.violation(&component, method, ViolationDetail::Resource(memory));
            if options.strict_limits && result.is_ok() {
                if let ResourceViolation::Memory { limit, observed } = memory {
                    result = Err(AdapterError::ResourceLimitExceeded {
                        component_id: component_id.to_string(),
                        resource: "memory".to_string(),
                        limit,
                        observed,
                    });
                }
            }
        }

        in_flight.settle();
        component.finish_invocation(result.is_ok(), elapsed, observed_memory);

        result.map(|value| InvocationReport {
            value,
            elapsed,
            observed_memory,
            compliance,
        })
    }

    /// Everything that can refuse a call before it claims the component.
    fn admit(&self, component: &Component, method: &str, params: &[TaggedValue]) -> Result<()> {
        let component_id = component.id();

        let state = component.state();
        if state != ComponentState::Ready {
            component.record_rejection(false);
            return Err(AdapterError::InvalidState {
                component_id: component_id.to_string(),
                state,
                operation: "invoke".to_string(),
            });
        }

        let declared = component.config().methods.is_empty() || component.signature(method).is_some();
        if !declared || !component.exports(method) {
            component.record_rejection(false);
            return Err(AdapterError::MethodNotFound {
                component_id: component_id.to_string(),
                method: method.to_string(),
            });
        }

        let signature = component.signature(method);
        if let Some(sig) = signature {
            if let Err(reason) = sig.check_arguments(params) {
                component.record_rejection(false);
                return Err(AdapterError::InvalidArguments {
                    component_id: component_id.to_string(),
                    method: method.to_string(),
                    reason,
                });
            }
        }

        let policy = component.policy();
        let required = signature.map(|s| s.required_permissions).unwrap_or_default();
        if !required.is_empty() {
            let missing = first_missing_permission(policy, required);
            if policy.audit_enabled {
                self.events.emit(AdapterEvent::SecurityAudit {
                    component_id: component_id.to_string(),
                    method: method.to_string(),
                    requested: required,
                    granted: missing.is_none(),
                    timestamp_ms: now_ms(),
                });
            }

            if let Some(permission) = missing {
                component.record_rejection(true);
                self.publish_violation(component_id, method, ViolationDetail::Permission { missing: permission });
                return Err(AdapterError::PermissionDenied {
                    component_id: component_id.to_string(),
                    method: method.to_string(),
                    permission,
                });
            }
        }

        Ok(())
    }

    fn violation(&self, component: &Component, method: &str, detail: ViolationDetail) {
        component.record_violation();
        self.publish_violation(component.id(), method, detail);
    }

    fn publish_violation(&self, component_id: &str, method: &str, detail: ViolationDetail) {
        warn!("Security violation in {}.{}: {:?}", component_id, method, detail);
        self.counters.security_violations.fetch_add(1, Ordering::Relaxed);
        self.metrics.violations.increment(1);
        self.events.emit(AdapterEvent::SecurityViolation {
            component_id: component_id.to_string(),
            method: method.to_string(),
            detail,
            timestamp_ms: now_ms(),
        });
    }

    fn record(&self, component_id: &str, method: &str, elapsed: Duration, outcome: &Result<InvocationReport>) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_execution_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.metrics.total.increment(1);
        self.metrics.duration.record(elapsed_ms);

        let (status, error) = match outcome {
            Ok(_) => {
                self.counters.successful.fetch_add(1, Ordering::Relaxed);
                (InvocationStatus::Success, None)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.metrics.failed.increment(1);
                let status = match e {
                    AdapterError::PermissionDenied { .. } => {
                        self.counters.denied.fetch_add(1, Ordering::Relaxed);
                        InvocationStatus::Denied
                    }
                    AdapterError::Timeout { .. } => {
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        InvocationStatus::Timeout
                    }
                    _ => InvocationStatus::Failed,
                };
                debug!("Invocation {}.{} failed: {}", component_id, method, e);
                (status, Some(e.to_string()))
            }
        };

        self.events.emit(AdapterEvent::InvocationLogged(InvocationRecord {
            component_id: component_id.to_string(),
            method: method.to_string(),
            elapsed_ms,
            status,
            error,
            timestamp_ms: now_ms(),
        }));
    }
}

/// Held while a component is EXECUTING on behalf of one call. If the
/// caller drops the invoke future first, the component is settled here
/// instead of staying EXECUTING forever.
struct InFlight<'a> {
    engine: &'a InvocationEngine,
    component: &'a Component,
    method: &'a str,
    started: Instant,
    /// The instance has been handed the call.
    dispatched: bool,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let component_id = self.component.id();
        let elapsed = self.started.elapsed();
        if self.dispatched {
            // The instance may have been interrupted mid-call
            self.component.finish_invocation(false, elapsed, 0);
        } else {
            self.component.abandon_invocation();
        }
        warn!(
            "Invocation {}.{} dropped by its caller after {:?} (component now {})",
            component_id,
            self.method,
            elapsed,
            self.component.state()
        );

        let outcome: Result<InvocationReport> = Err(AdapterError::Execution {
            component_id: component_id.to_string(),
            method: self.method.to_string(),
            message: "invocation cancelled before completion".to_string(),
        });
        self.engine.record(component_id, self.method, elapsed, &outcome);
    }
}
