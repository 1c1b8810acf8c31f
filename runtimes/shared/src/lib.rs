use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod errors;
pub mod security;
pub mod value;

pub use errors::*;
pub use security::*;
pub use value::*;

static COMPONENT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));
static IDENTIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

pub fn is_valid_component_id(id: &str) -> bool {
    COMPONENT_ID.is_match(id)
}

pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Language {
    C,
    #[serde(rename = "JAVASCRIPT")]
    JavaScript,
    Python,
    Jvm,
    Wasm,
    Unknown,
}

impl Default for Language {
    fn default() -> Self {
        Language::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MethodSignature {
    pub name: String,
    #[serde(default)]
    pub parameter_types: Vec<ValueType>,
    #[serde(default = "any_type")]
    pub return_type: ValueType,
    #[serde(default)]
    pub required_permissions: Permissions,
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,
}

fn any_type() -> ValueType {
    ValueType::Any
}

impl MethodSignature {
    pub fn new(name: impl Into<String>, parameter_types: Vec<ValueType>, return_type: ValueType) -> Self {
        Self {
            name: name.into(),
            parameter_types,
            return_type,
            required_permissions: Permissions::NONE,
            max_execution_time_ms: None,
        }
    }

    pub fn requires(mut self, permissions: Permissions) -> Self {
        self.required_permissions |= permissions;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.max_execution_time_ms = Some(timeout_ms);
        self
    }

    /// Checks arity and parameter types. Returns a description of the first mismatch.
    pub fn check_arguments(&self, params: &[TaggedValue]) -> std::result::Result<(), String> {
        if params.len() != self.parameter_types.len() {
            return Err(format!(
                "expected {} parameters, got {}",
                self.parameter_types.len(),
                params.len()
            ));
        }

        for (index, (expected, param)) in self.parameter_types.iter().zip(params).enumerate() {
            if !expected.accepts(param.value_type()) {
                return Err(format!(
                    "parameter {} expected {}, got {}",
                    index,
                    expected,
                    param.value_type()
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentConfig {
    pub component_id: String,
    pub component_name: String,
    pub version: String,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub security_policy: Option<SecurityPolicy>,
    #[serde(default)]
    pub methods: Vec<MethodSignature>,
    #[serde(default)]
    pub language_specific_config: BTreeMap<String, String>,
}

impl ComponentConfig {
    pub fn new(
        component_id: impl Into<String>,
        component_name: impl Into<String>,
        version: impl Into<String>,
        language: Language,
    ) -> Self {
        Self {
            component_id: component_id.into(),
            component_name: component_name.into(),
            version: version.into(),
            language,
            security_policy: None,
            methods: Vec::new(),
            language_specific_config: BTreeMap::new(),
        }
    }

    pub fn with_method(mut self, method: MethodSignature) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_policy(mut self, policy: SecurityPolicy) -> Self {
        self.security_policy = Some(policy);
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.language_specific_config.insert(key.into(), value.into());
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodSignature> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.component_id.is_empty() {
            return Err(AdapterError::configuration("component_id is empty"));
        }
        if !is_valid_component_id(&self.component_id) {
            return Err(AdapterError::configuration(format!(
                "component_id '{}' may only contain [A-Za-z0-9_-]",
                self.component_id
            )));
        }
        if self.component_name.trim().is_empty() {
            return Err(AdapterError::configuration(format!(
                "component_name of '{}' is empty",
                self.component_id
            )));
        }
        if self.version.trim().is_empty() {
            return Err(AdapterError::configuration(format!(
                "version of '{}' is empty",
                self.component_id
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for method in &self.methods {
            if !is_valid_identifier(&method.name) {
                return Err(AdapterError::configuration(format!(
                    "method name '{}' is not a valid identifier",
                    method.name
                )));
            }
            if !seen.insert(method.name.as_str()) {
                return Err(AdapterError::configuration(format!(
                    "method '{}' declared twice",
                    method.name
                )));
            }
        }

        Ok(())
    }
}

/// Component lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentState {
    Uninitialized,
    Initializing,
    Ready,
    Executing,
    Suspended,
    Error,
    Cleanup,
    Destroyed,
}

impl ComponentState {
    pub fn can_transition_to(self, next: ComponentState) -> bool {
        use ComponentState::*;

        match (self, next) {
            (Uninitialized, Initializing) => true,
            (Initializing, Ready) => true,
            (Ready, Executing) | (Executing, Ready) => true,
            (Ready, Suspended) | (Suspended, Ready) => true,
            (Initializing | Ready | Executing | Suspended | Cleanup, Error) => true,
            // A running call must finish before teardown
            (Executing, Cleanup) => false,
            (Destroyed, _) | (Cleanup, Cleanup) => false,
            (_, Cleanup) => true,
            (Cleanup, Destroyed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ComponentState::Destroyed
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentState::Uninitialized => "UNINITIALIZED",
            ComponentState::Initializing => "INITIALIZING",
            ComponentState::Ready => "READY",
            ComponentState::Executing => "EXECUTING",
            ComponentState::Suspended => "SUSPENDED",
            ComponentState::Error => "ERROR",
            ComponentState::Cleanup => "CLEANUP",
            ComponentState::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc_config() -> ComponentConfig {
        ComponentConfig::new("calc_001", "Calculator", "1.0.0", Language::Python).with_method(
            MethodSignature::new("add", vec![ValueType::Int64, ValueType::Int64], ValueType::Int64),
        )
    }

    #[test]
    fn test_config_validation() {
        assert!(calc_config().validate().is_ok());

        let mut bad_id = calc_config();
        bad_id.component_id = "calc 001".to_string();
        assert!(matches!(bad_id.validate(), Err(AdapterError::Configuration { .. })));

        let mut empty_id = calc_config();
        empty_id.component_id.clear();
        assert!(empty_id.validate().is_err());

        let mut empty_name = calc_config();
        empty_name.component_name = "  ".to_string();
        assert!(empty_name.validate().is_err());

        let mut empty_version = calc_config();
        empty_version.version.clear();
        assert!(empty_version.validate().is_err());

        let bad_method = calc_config().with_method(MethodSignature::new("2fast", vec![], ValueType::Null));
        assert!(bad_method.validate().is_err());

        let duplicate = calc_config().with_method(MethodSignature::new("add", vec![], ValueType::Null));
        assert!(duplicate.validate().is_err());

        let hyphenated = ComponentConfig::new("bank-account_2", "Bank", "0.1.0", Language::C);
        assert!(hyphenated.validate().is_ok());
    }

    #[test]
    fn test_argument_checks() {
        let config = calc_config();
        let add = config.method("add").unwrap();

        assert!(add.check_arguments(&[TaggedValue::Int32(2), TaggedValue::Int64(3)]).is_ok());
        assert!(add.check_arguments(&[TaggedValue::Int32(2)]).is_err());
        let err = add
            .check_arguments(&[TaggedValue::Int32(2), TaggedValue::from("3")])
            .unwrap_err();
        assert_eq!(err, "parameter 1 expected int64, got string");
    }

    #[test]
    fn test_state_machine() {
        use ComponentState::*;

        assert!(Uninitialized.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Ready));
        assert!(Executing.can_transition_to(Error));
        assert!(Ready.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Ready));
        assert!(Error.can_transition_to(Cleanup));
        assert!(Suspended.can_transition_to(Cleanup));
        assert!(Cleanup.can_transition_to(Destroyed));
        assert!(Cleanup.can_transition_to(Error));

        assert!(!Suspended.can_transition_to(Executing));
        assert!(!Error.can_transition_to(Ready));
        assert!(!Executing.can_transition_to(Cleanup));
        assert!(!Executing.can_transition_to(Suspended));
        assert!(!Ready.can_transition_to(Destroyed));
        for next in [Uninitialized, Initializing, Ready, Executing, Suspended, Error, Cleanup, Destroyed] {
            assert!(!Destroyed.can_transition_to(next));
        }
        assert!(Destroyed.is_terminal());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "component_id": "bank_01",
            "component_name": "Banking",
            "version": "2.1.0",
            "language": "PYTHON",
            "methods": [
                {"name": "deposit", "parameter_types": ["float64"], "required_permissions": ["MEMORY_WRITE"]}
            ],
            "language_specific_config": {"interpreter": "/usr/bin/python3"}
        }"#;

        let config: ComponentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.language, Language::Python);
        assert!(config.security_policy.is_none());
        let deposit = config.method("deposit").unwrap();
        assert_eq!(deposit.return_type, ValueType::Any);
        assert_eq!(deposit.required_permissions, Permissions::MEMORY_WRITE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_language_names() {
        assert_eq!(serde_json::to_string(&Language::JavaScript).unwrap(), r#""JAVASCRIPT""#);
        assert_eq!(serde_json::to_string(&Language::Jvm).unwrap(), r#""JVM""#);
        let parsed: Language = serde_json::from_str(r#""JAVASCRIPT""#).unwrap();
        assert_eq!(parsed, Language::JavaScript);
        assert!(serde_json::from_str::<Language>(r#""JAVA_SCRIPT""#).is_err());

        let json = r#"{"component_id": "ui_01", "component_name": "Widgets", "version": "0.3.0", "language": "JAVASCRIPT"}"#;
        let config: ComponentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.language, Language::JavaScript);
    }
}
