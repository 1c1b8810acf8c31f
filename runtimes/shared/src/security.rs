use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::str::FromStr;

/// Permission bitmask over the fixed capability universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const MEMORY_READ: Permissions = Permissions(1 << 0);
    pub const MEMORY_WRITE: Permissions = Permissions(1 << 1);
    pub const INVOKE_LOCAL: Permissions = Permissions(1 << 2);
    pub const INVOKE_REMOTE: Permissions = Permissions(1 << 3);
    pub const FILE_ACCESS: Permissions = Permissions(1 << 4);
    pub const NETWORK: Permissions = Permissions(1 << 5);
    pub const PRIVILEGED: Permissions = Permissions(1 << 6);
    pub const ALL: Permissions = Permissions((1 << 7) - 1);

    const NAMED: [(Permissions, &'static str); 7] = [
        (Permissions::MEMORY_READ, "MEMORY_READ"),
        (Permissions::MEMORY_WRITE, "MEMORY_WRITE"),
        (Permissions::INVOKE_LOCAL, "INVOKE_LOCAL"),
        (Permissions::INVOKE_REMOTE, "INVOKE_REMOTE"),
        (Permissions::FILE_ACCESS, "FILE_ACCESS"),
        (Permissions::NETWORK, "NETWORK"),
        (Permissions::PRIVILEGED, "PRIVILEGED"),
    ];

    /// Bits outside the universe are dropped.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Permissions(bits & Permissions::ALL.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Permissions) -> bool {
        self.0 & other.0 != 0
    }

    /// Complement within the permission universe.
    pub const fn complement(self) -> Self {
        Permissions(!self.0 & Permissions::ALL.0)
    }

    pub const fn difference(self, other: Permissions) -> Self {
        Permissions(self.0 & !other.0)
    }

    /// Individual bits in declaration order.
    pub fn iter(self) -> impl Iterator<Item = Permissions> {
        Self::NAMED
            .iter()
            .map(|(bit, _)| *bit)
            .filter(move |bit| self.contains(*bit))
    }

    fn name(self) -> Option<&'static str> {
        Self::NAMED
            .iter()
            .find(|(bit, _)| *bit == self)
            .map(|(_, name)| *name)
    }
}

impl BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Self) -> Self::Output {
        Permissions(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permissions {
    type Output = Permissions;

    fn bitand(self, rhs: Self) -> Self::Output {
        Permissions(self.0 & rhs.0)
    }
}

impl Not for Permissions {
    type Output = Permissions;

    fn not(self) -> Self::Output {
        self.complement()
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names: Vec<&str> = self.iter().filter_map(|bit| bit.name()).collect();
        f.write_str(&names.join("|"))
    }
}

impl FromStr for Permissions {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut permissions = Permissions::NONE;
        for part in s.split('|').map(str::trim).filter(|p| !p.is_empty()) {
            let upper = part.to_ascii_uppercase();
            match upper.as_str() {
                "NONE" => {}
                "ALL" => permissions |= Permissions::ALL,
                name => {
                    let bit = Self::NAMED
                        .iter()
                        .find(|(_, n)| *n == name)
                        .map(|(bit, _)| *bit)
                        .ok_or_else(|| format!("unknown permission '{}'", part))?;
                    permissions |= bit;
                }
            }
        }
        Ok(permissions)
    }
}

impl Serialize for Permissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names: Vec<&str> = self.iter().filter_map(|bit| bit.name()).collect();
        names.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut permissions = Permissions::NONE;
        for name in names {
            permissions |= name.parse::<Permissions>().map_err(de::Error::custom)?;
        }
        Ok(permissions)
    }
}

/// Ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    None,
    Basic,
    Standard,
    Strict,
    Paranoid,
}

impl IsolationLevel {
    pub const ALL: [IsolationLevel; 5] = [
        IsolationLevel::None,
        IsolationLevel::Basic,
        IsolationLevel::Standard,
        IsolationLevel::Strict,
        IsolationLevel::Paranoid,
    ];

    pub fn canonical_permissions(self) -> Permissions {
        match self {
            IsolationLevel::None => Permissions::ALL,
            IsolationLevel::Basic => {
                Permissions::MEMORY_READ | Permissions::MEMORY_WRITE | Permissions::INVOKE_LOCAL
            }
            IsolationLevel::Standard => Permissions::MEMORY_READ | Permissions::INVOKE_LOCAL,
            IsolationLevel::Strict => Permissions::MEMORY_READ,
            IsolationLevel::Paranoid => Permissions::NONE,
        }
    }

    pub fn memory_ceiling(self) -> u64 {
        const MB: u64 = 1024 * 1024;
        match self {
            IsolationLevel::None => 128 * MB,
            IsolationLevel::Basic => 64 * MB,
            IsolationLevel::Standard => 32 * MB,
            IsolationLevel::Strict => 16 * MB,
            IsolationLevel::Paranoid => 8 * MB,
        }
    }

    pub fn execution_ceiling_ms(self) -> u64 {
        match self {
            IsolationLevel::None => 60_000,
            IsolationLevel::Basic => 30_000,
            IsolationLevel::Standard => 10_000,
            IsolationLevel::Strict => 5_000,
            IsolationLevel::Paranoid => 1_000,
        }
    }
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::Standard
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::None => "NONE",
            IsolationLevel::Basic => "BASIC",
            IsolationLevel::Standard => "STANDARD",
            IsolationLevel::Strict => "STRICT",
            IsolationLevel::Paranoid => "PARANOID",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub isolation_level: IsolationLevel,
    pub allowed_permissions: Permissions,
    pub denied_permissions: Permissions,
    pub max_memory_usage: u64,
    pub max_execution_time_ms: u64,
    pub audit_enabled: bool,
    pub stack_protection_enabled: bool,
    pub heap_protection_enabled: bool,
}

impl SecurityPolicy {
    pub fn new(isolation_level: IsolationLevel) -> Self {
        create_default_policy(isolation_level)
    }

    /// Moves `permissions` from allowed to denied. Never grants.
    pub fn deny(mut self, permissions: Permissions) -> Self {
        self.allowed_permissions = self.allowed_permissions.difference(permissions);
        self.denied_permissions |= permissions;
        self
    }

    /// Bits that pass `check_permission`.
    pub fn effective_permissions(&self) -> Permissions {
        self.allowed_permissions.difference(self.denied_permissions)
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        create_default_policy(IsolationLevel::default())
    }
}

pub fn create_default_policy(isolation_level: IsolationLevel) -> SecurityPolicy {
    let allowed = isolation_level.canonical_permissions();

    SecurityPolicy {
        isolation_level,
        allowed_permissions: allowed,
        denied_permissions: allowed.complement(),
        max_memory_usage: isolation_level.memory_ceiling(),
        max_execution_time_ms: isolation_level.execution_ceiling_ms(),
        audit_enabled: isolation_level >= IsolationLevel::Strict,
        stack_protection_enabled: isolation_level >= IsolationLevel::Standard,
        heap_protection_enabled: isolation_level >= IsolationLevel::Strict,
    }
}

/// Denial wins when a bit is both allowed and denied.
pub fn check_permission(policy: &SecurityPolicy, requested: Permissions) -> bool {
    !requested.is_empty()
        && policy.allowed_permissions.contains(requested)
        && !policy.denied_permissions.intersects(requested)
}

/// Checks every bit of `required`; returns the first one the policy withholds.
pub fn first_missing_permission(policy: &SecurityPolicy, required: Permissions) -> Option<Permissions> {
    required.iter().find(|bit| !check_permission(policy, *bit))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceViolation {
    Memory { limit: u64, observed: u64 },
    ExecutionTime { limit_ms: u64, observed_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ComplianceResult {
    pub violations: Vec<ResourceViolation>,
}

impl ComplianceResult {
    pub fn is_compliant(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn memory_violation(&self) -> Option<ResourceViolation> {
        self.violations
            .iter()
            .copied()
            .find(|v| matches!(v, ResourceViolation::Memory { .. }))
    }

    pub fn time_violation(&self) -> Option<ResourceViolation> {
        self.violations
            .iter()
            .copied()
            .find(|v| matches!(v, ResourceViolation::ExecutionTime { .. }))
    }
}

pub fn check_resource_limits(
    policy: &SecurityPolicy,
    observed_memory: u64,
    observed_time_ms: u64,
) -> ComplianceResult {
    let mut violations = Vec::new();

    if observed_memory > policy.max_memory_usage {
        violations.push(ResourceViolation::Memory {
            limit: policy.max_memory_usage,
            observed: observed_memory,
        });
    }

    if observed_time_ms > policy.max_execution_time_ms {
        violations.push(ResourceViolation::ExecutionTime {
            limit_ms: policy.max_execution_time_ms,
            observed_ms: observed_time_ms,
        });
    }

    ComplianceResult { violations }
}
