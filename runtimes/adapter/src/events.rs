use dashmap::DashMap;
use dop_shared::{IsolationLevel, Language, Permissions, ResourceViolation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, trace};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Initialized,
    ComponentRegistered,
    ComponentUnregistered,
    ComponentSuspended,
    ComponentResumed,
    InvocationLogged,
    SecurityViolation,
    SecurityAudit,
    Cleanup,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Initialized,
        EventKind::ComponentRegistered,
        EventKind::ComponentUnregistered,
        EventKind::ComponentSuspended,
        EventKind::ComponentResumed,
        EventKind::InvocationLogged,
        EventKind::SecurityViolation,
        EventKind::SecurityAudit,
        EventKind::Cleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Initialized => "initialized",
            EventKind::ComponentRegistered => "component_registered",
            EventKind::ComponentUnregistered => "component_unregistered",
            EventKind::ComponentSuspended => "component_suspended",
            EventKind::ComponentResumed => "component_resumed",
            EventKind::InvocationLogged => "invocation_logged",
            EventKind::SecurityViolation => "security_violation",
            EventKind::SecurityAudit => "security_audit",
            EventKind::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Success,
    Failed,
    Denied,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub component_id: String,
    pub method: String,
    pub elapsed_ms: f64,
    pub status: InvocationStatus,
    pub error: Option<String>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViolationDetail {
    Permission { missing: Permissions },
    Resource(ResourceViolation),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AdapterEvent {
    Initialized {
        adapter_id: Uuid,
        isolation_level: IsolationLevel,
        timestamp_ms: u64,
    },
    ComponentRegistered {
        component_id: String,
        component_name: String,
        language: Language,
        timestamp_ms: u64,
    },
    ComponentUnregistered {
        component_id: String,
        forced: bool,
        timestamp_ms: u64,
    },
    ComponentSuspended {
        component_id: String,
        timestamp_ms: u64,
    },
    ComponentResumed {
        component_id: String,
        timestamp_ms: u64,
    },
    InvocationLogged(InvocationRecord),
    SecurityViolation {
        component_id: String,
        method: String,
        detail: ViolationDetail,
        timestamp_ms: u64,
    },
    SecurityAudit {
        component_id: String,
        method: String,
        requested: Permissions,
        granted: bool,
        timestamp_ms: u64,
    },
    Cleanup {
        adapter_id: Uuid,
        components_released: usize,
        cleanup_failures: usize,
        timestamp_ms: u64,
    },
}

impl AdapterEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AdapterEvent::Initialized { .. } => EventKind::Initialized,
            AdapterEvent::ComponentRegistered { .. } => EventKind::ComponentRegistered,
            AdapterEvent::ComponentUnregistered { .. } => EventKind::ComponentUnregistered,
            AdapterEvent::ComponentSuspended { .. } => EventKind::ComponentSuspended,
            AdapterEvent::ComponentResumed { .. } => EventKind::ComponentResumed,
            AdapterEvent::InvocationLogged(_) => EventKind::InvocationLogged,
            AdapterEvent::SecurityViolation { .. } => EventKind::SecurityViolation,
            AdapterEvent::SecurityAudit { .. } => EventKind::SecurityAudit,
            AdapterEvent::Cleanup { .. } => EventKind::Cleanup,
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub type Listener = Arc<dyn Fn(&AdapterEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// In-process publish/subscribe keyed by event kind.
#[derive(Default)]
pub struct EventBus {
    listeners: DashMap<EventKind, Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.entry(kind).or_default().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> bool {
        match self.listeners.get_mut(&kind) {
            Some(mut entries) => {
                let before = entries.len();
                entries.retain(|(existing, _)| *existing != id);
                entries.len() != before
            }
            None => false,
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map(|entries| entries.len()).unwrap_or(0)
    }

    /// Delivers to a snapshot of the current subscribers. A panicking
    /// listener is logged and skipped.
    pub fn emit(&self, event: AdapterEvent) {
        let kind = event.kind();
        let snapshot: Vec<Listener> = match self.listeners.get(&kind) {
            Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
        };

        trace!("Emitting {} to {} listeners", kind, snapshot.len());

        for listener in snapshot {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener(&event)));
            if let Err(cause) = delivered {
                let message = cause
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| cause.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Listener for {} failed: {}", kind, message);
            }
        }
    }
}
