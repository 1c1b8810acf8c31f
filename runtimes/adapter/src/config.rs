use anyhow::{Context, Result};
use dop_shared::{create_default_policy, IsolationLevel, Permissions, SecurityPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Adjustments applied on top of the canonical policy for `default_isolation`.
/// Permissions can only be taken away here, never granted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverrides {
    pub max_memory_usage: Option<u64>,
    pub max_execution_time_ms: Option<u64>,
    pub audit_enabled: Option<bool>,
    pub stack_protection_enabled: Option<bool>,
    pub heap_protection_enabled: Option<bool>,
    pub additional_denied: Permissions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub default_isolation: IsolationLevel,
    pub policy_overrides: PolicyOverrides,
    pub max_components: Option<usize>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            default_isolation: IsolationLevel::Standard,
            policy_overrides: PolicyOverrides::default(),
            max_components: None,
        }
    }
}

impl AdapterConfig {
    pub fn with_isolation(isolation: IsolationLevel) -> Self {
        Self {
            default_isolation: isolation,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid adapter configuration")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read adapter configuration {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// The adapter-wide default policy: canonical policy plus overrides.
    pub fn merged_policy(&self) -> SecurityPolicy {
        let overrides = &self.policy_overrides;
        let mut policy = create_default_policy(self.default_isolation).deny(overrides.additional_denied);

        if let Some(max_memory) = overrides.max_memory_usage {
            policy.max_memory_usage = max_memory;
        }
        if let Some(max_time) = overrides.max_execution_time_ms {
            policy.max_execution_time_ms = max_time;
        }
        if let Some(audit) = overrides.audit_enabled {
            policy.audit_enabled = audit;
        }
        if let Some(stack) = overrides.stack_protection_enabled {
            policy.stack_protection_enabled = stack;
        }
        if let Some(heap) = overrides.heap_protection_enabled {
            policy.heap_protection_enabled = heap;
        }

        policy
    }
}
