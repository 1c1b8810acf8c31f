use crate::{ComponentState, Permissions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("Invalid component configuration: {reason}")]
    Configuration { reason: String },

    #[error("Component already registered: {component_id}")]
    DuplicateComponent { component_id: String },

    #[error("Adapter not initialized")]
    NotInitialized,

    #[error("Adapter already initialized")]
    AlreadyInitialized,

    #[error("Component not found: {component_id}")]
    ComponentNotFound { component_id: String },

    #[error("Component {component_id} cannot {operation} while {state}")]
    InvalidState {
        component_id: String,
        state: ComponentState,
        operation: String,
    },

    #[error("Method not found: {component_id}.{method}")]
    MethodNotFound { component_id: String, method: String },

    #[error("Permission denied for {component_id}.{method}: missing {permission}")]
    PermissionDenied {
        component_id: String,
        method: String,
        permission: Permissions,
    },

    #[error("Resource limit exceeded on {component_id}: {resource} {observed} > {limit}")]
    ResourceLimitExceeded {
        component_id: String,
        resource: String,
        limit: u64,
        observed: u64,
    },

    #[error("Timeout exceeded on {component_id}.{method}: {elapsed_ms}ms > {limit_ms}ms")]
    Timeout {
        component_id: String,
        method: String,
        limit_ms: u64,
        elapsed_ms: u64,
    },

    #[error("Cleanup failed for {component_id}: {reason}")]
    Cleanup { component_id: String, reason: String },

    #[error("Invalid arguments for {component_id}.{method}: {reason}")]
    InvalidArguments {
        component_id: String,
        method: String,
        reason: String,
    },

    #[error("Execution failed in {component_id}.{method}: {message}")]
    Execution {
        component_id: String,
        method: String,
        message: String,
    },

    #[error("Capability provider error: {reason}")]
    Provider { reason: String },

    #[error("Cannot marshal {found} into {expected}")]
    Marshal { expected: String, found: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// What the caller should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    RetryLater,
    FixCall,
    FixEnvironment,
    Fatal,
}

impl AdapterError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AdapterError::InvalidState { .. }
            | AdapterError::Timeout { .. } => ErrorClass::RetryLater,
            AdapterError::Configuration { .. }
            | AdapterError::NotInitialized
            | AdapterError::AlreadyInitialized
            | AdapterError::DuplicateComponent { .. }
            | AdapterError::ComponentNotFound { .. }
            | AdapterError::MethodNotFound { .. }
            | AdapterError::PermissionDenied { .. }
            | AdapterError::InvalidArguments { .. }
            | AdapterError::Execution { .. }
            | AdapterError::Marshal { .. } => ErrorClass::FixCall,
            AdapterError::ResourceLimitExceeded { .. }
            | AdapterError::Provider { .. }
            | AdapterError::Cleanup { .. } => ErrorClass::FixEnvironment,
            AdapterError::Internal(_) => ErrorClass::Fatal,
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        AdapterError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn provider(err: anyhow::Error) -> Self {
        AdapterError::Provider {
            reason: format!("{:#}", err),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
