use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::AuditDecision;
use crate::policy::{FailMode, PolicyRecord};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenantRow {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkspaceRow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub upstream_url: String,
    pub fail_mode: FailMode,
    pub decision_timeout_ms: u64,
}

/// Access keys are stored hashed; the plaintext prefix exists for admin
/// listings only. Exactly one live row per hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessKeyRow {
    pub id: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub workspace_id: String,
    pub agent_name: String,
    pub scopes: Vec<String>,
    pub is_active: bool,
    pub is_revoked: bool,
    pub expires_at_ms: Option<i64>,
    pub last_used_at_ms: Option<i64>,
    pub usage_count: u64,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Read surface the data path needs plus the two background writes. The
/// administrative CRUD surface owns entity lifecycle and talks to the same
/// tables from outside this crate.
pub trait GovernanceRepository: Send + Sync {
    fn find_access_key(&self, key_hash: &str) -> Result<Option<AccessKeyRow>, RepositoryError>;
    fn find_workspace(&self, workspace_id: &str) -> Result<Option<WorkspaceRow>, RepositoryError>;
    fn policies_for(
        &self,
        tenant_id: &str,
        workspace_id: &str,
        agent_id: &str,
    ) -> Result<Vec<PolicyRecord>, RepositoryError>;
    fn record_key_usage(&self, key_id: &str, at_ms: i64) -> Result<(), RepositoryError>;
    fn insert_decision(&self, decision: &AuditDecision) -> Result<(), RepositoryError>;
    fn list_decisions(&self, limit: usize) -> Result<Vec<AuditDecision>, RepositoryError>;
}

#[derive(Default)]
pub struct InMemoryGovernanceRepository {
    workspaces: Mutex<Vec<WorkspaceRow>>,
    keys: Mutex<Vec<AccessKeyRow>>,
    policies: Mutex<Vec<PolicyRecord>>,
    decisions: Mutex<Vec<AuditDecision>>,
}

impl InMemoryGovernanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert_workspace(&self, workspace: WorkspaceRow) {
        self.workspaces.lock().push(workspace);
    }

    pub fn insert_access_key(&self, key: AccessKeyRow) {
        self.keys.lock().push(key);
    }

    pub fn insert_policy(&self, policy: PolicyRecord) {
        self.policies.lock().push(policy);
    }

    pub fn decisions(&self) -> Vec<AuditDecision> {
        self.decisions.lock().clone()
    }

    pub fn access_key(&self, key_id: &str) -> Option<AccessKeyRow> {
        self.keys.lock().iter().find(|key| key.id == key_id).cloned()
    }
}

impl GovernanceRepository for InMemoryGovernanceRepository {
    fn find_access_key(&self, key_hash: &str) -> Result<Option<AccessKeyRow>, RepositoryError> {
        Ok(self
            .keys
            .lock()
            .iter()
            .find(|key| key.key_hash == key_hash)
            .cloned())
    }

    fn find_workspace(&self, workspace_id: &str) -> Result<Option<WorkspaceRow>, RepositoryError> {
        Ok(self
            .workspaces
            .lock()
            .iter()
            .find(|workspace| workspace.id == workspace_id)
            .cloned())
    }

    fn policies_for(
        &self,
        tenant_id: &str,
        workspace_id: &str,
        agent_id: &str,
    ) -> Result<Vec<PolicyRecord>, RepositoryError> {
        Ok(self
            .policies
            .lock()
            .iter()
            .filter(|policy| {
                policy.enabled
                    && policy.tenant_id == tenant_id
                    && policy
                        .workspace_id
                        .as_deref()
                        .map(|id| id == workspace_id)
                        .unwrap_or(true)
                    && policy
                        .agent_id
                        .as_deref()
                        .map(|id| id == agent_id)
                        .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    fn record_key_usage(&self, key_id: &str, at_ms: i64) -> Result<(), RepositoryError> {
        let mut keys = self.keys.lock();
        if let Some(key) = keys.iter_mut().find(|key| key.id == key_id) {
            key.last_used_at_ms = Some(at_ms);
            key.usage_count += 1;
        }
        Ok(())
    }

    fn insert_decision(&self, decision: &AuditDecision) -> Result<(), RepositoryError> {
        self.decisions.lock().push(decision.clone());
        Ok(())
    }

    fn list_decisions(&self, limit: usize) -> Result<Vec<AuditDecision>, RepositoryError> {
        let decisions = self.decisions.lock();
        Ok(decisions.iter().rev().take(limit).cloned().collect())
    }
}
