use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::audit::{AuditSink, AuditTask};
use crate::policy::FailMode;
use crate::repository::GovernanceRepository;

/// Everything the data path needs to know about one request, derived from
/// the bearer key. Never persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    pub tenant_id: String,
    pub workspace_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub scopes: Vec<String>,
    pub upstream_url: String,
    pub fail_mode: FailMode,
    pub decision_timeout_ms: u64,
    pub received_at_ms: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("auth store error: {0}")]
    Store(String),
}

pub fn hash_access_key(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn extract_bearer(header: &str) -> Option<&str> {
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

pub trait KeyAuthority: Send + Sync {
    fn authenticate(&self, authorization: Option<&str>) -> Result<RequestContext, AuthError>;
}

/// Validates bearer keys against the governance repository. Usage stats
/// go through the background channel so the lookup path never waits on a
/// write.
pub struct RepositoryKeyAuthority {
    repo: Arc<dyn GovernanceRepository>,
    audit: Arc<dyn AuditSink>,
}

impl RepositoryKeyAuthority {
    pub fn new(repo: Arc<dyn GovernanceRepository>, audit: Arc<dyn AuditSink>) -> Self {
        Self { repo, audit }
    }
}

impl KeyAuthority for RepositoryKeyAuthority {
    fn authenticate(&self, authorization: Option<&str>) -> Result<RequestContext, AuthError> {
        let header = authorization
            .ok_or_else(|| AuthError::Unauthorized("missing authorization header".to_string()))?;
        let token = extract_bearer(header)
            .ok_or_else(|| AuthError::Unauthorized("malformed bearer token".to_string()))?;

        let key_hash = hash_access_key(token);
        let key = self
            .repo
            .find_access_key(&key_hash)
            .map_err(|err| AuthError::Store(err.to_string()))?
            .ok_or_else(|| AuthError::Unauthorized("unknown access key".to_string()))?;

        if !key.is_active {
            return Err(AuthError::Unauthorized("access key inactive".to_string()));
        }
        if key.is_revoked {
            return Err(AuthError::Unauthorized("access key revoked".to_string()));
        }
        let now = now_ms();
        if let Some(expires_at) = key.expires_at_ms {
            if expires_at <= now {
                return Err(AuthError::Unauthorized("access key expired".to_string()));
            }
        }

        let workspace = self
            .repo
            .find_workspace(&key.workspace_id)
            .map_err(|err| AuthError::Store(err.to_string()))?
            .ok_or_else(|| AuthError::Unauthorized("workspace not found".to_string()))?;

        self.audit.submit(AuditTask::KeyUsage {
            key_id: key.id.clone(),
            at_ms: now,
        });

        debug!(
            agent_id = %key.id,
            workspace_id = %workspace.id,
            tenant_id = %workspace.tenant_id,
            "access key validated"
        );

        Ok(RequestContext {
            request_id: Uuid::new_v4().to_string(),
            tenant_id: workspace.tenant_id,
            workspace_id: workspace.id,
            agent_id: key.id,
            agent_name: key.agent_name,
            scopes: key.scopes,
            upstream_url: workspace.upstream_url,
            fail_mode: workspace.fail_mode,
            decision_timeout_ms: workspace.decision_timeout_ms,
            received_at_ms: now,
        })
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
