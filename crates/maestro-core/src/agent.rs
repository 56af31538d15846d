use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::AgentId;

/// Operations a security context may be granted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    RegisterAgent,
    ExecuteStage,
    ManageWorkflows,
    ReadMetrics,
    /// Implies every other permission.
    Admin,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegisterAgent => "register_agent",
            Self::ExecuteStage => "execute_stage",
            Self::ManageWorkflows => "manage_workflows",
            Self::ReadMetrics => "read_metrics",
            Self::Admin => "admin",
        }
    }
}

/// Coarse permission bundles, ordered by privilege.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Worker,
    Operator,
    Admin,
}

impl Role {
    pub fn permissions(self) -> BTreeSet<Permission> {
        let granted: &[Permission] = match self {
            Self::Viewer => &[Permission::ReadMetrics],
            Self::Worker => &[Permission::RegisterAgent, Permission::ExecuteStage],
            Self::Operator => &[
                Permission::RegisterAgent,
                Permission::ExecuteStage,
                Permission::ManageWorkflows,
                Permission::ReadMetrics,
            ],
            Self::Admin => &[Permission::Admin],
        };
        granted.iter().copied().collect()
    }
}

/// Credentials presented when registering an agent.
#[derive(Clone)]
pub struct SecurityContext {
    pub principal: String,
    pub token: SecretString,
    pub permissions: BTreeSet<Permission>,
    pub expires_at: DateTime<Utc>,
}

impl SecurityContext {
    pub fn new(
        principal: impl Into<String>,
        token: impl Into<String>,
        permissions: impl IntoIterator<Item = Permission>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            principal: principal.into(),
            token: SecretString::from(token.into()),
            permissions: permissions.into_iter().collect(),
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn has_token(&self) -> bool {
        !self.token.expose_secret().trim().is_empty()
    }

    pub fn grants(&self, permission: Permission) -> bool {
        self.permissions.contains(&Permission::Admin) || self.permissions.contains(&permission)
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("principal", &self.principal)
            .field("token", &"[REDACTED]")
            .field("permissions", &self.permissions)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of a security check. Denials are values, not errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityVerdict {
    pub valid: bool,
    pub reason: Option<String>,
}

impl SecurityVerdict {
    pub fn allow() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }

    pub fn reason_or_default(&self) -> &str {
        self.reason.as_deref().unwrap_or("security check failed")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_type: String,
    #[serde(default)]
    pub parameters: Value,
}

impl AgentConfig {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            parameters: Value::Null,
        }
    }
}

/// A registered agent as stored by the coordinator.
#[derive(Clone, Debug)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub config: AgentConfig,
    pub security: SecurityContext,
    pub registered_at: DateTime<Utc>,
}
