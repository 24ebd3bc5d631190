use std::sync::Arc;

use parking_lot::Mutex;
use postgres::{Client, NoTls};

use crate::audit::AuditDecision;
use crate::policy::{Direction, FailMode, GuardrailKind, PolicyAction, PolicyRecord};
use crate::repository::{AccessKeyRow, GovernanceRepository, RepositoryError, WorkspaceRow};

pub struct PgGovernanceRepository {
    client: Arc<Mutex<Client>>,
}

impl PgGovernanceRepository {
    pub fn connect(dsn: &str) -> Result<Self, RepositoryError> {
        let client = Client::connect(dsn, NoTls).map_err(store_err)?;
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn ensure_schema(&self) -> Result<(), RepositoryError> {
        let mut client = self.client.lock();
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS tenants (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    deleted_at TIMESTAMPTZ
                );
                CREATE TABLE IF NOT EXISTS workspaces (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id),
                    name TEXT NOT NULL,
                    upstream_url TEXT NOT NULL,
                    fail_mode TEXT NOT NULL DEFAULT 'closed',
                    decision_timeout_ms BIGINT NOT NULL DEFAULT 5000,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    deleted_at TIMESTAMPTZ
                );
                CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL REFERENCES tenants(id),
                    email TEXT NOT NULL,
                    role TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    deleted_at TIMESTAMPTZ
                );
                CREATE TABLE IF NOT EXISTS agent_access_keys (
                    id TEXT PRIMARY KEY,
                    key_hash TEXT NOT NULL,
                    key_prefix TEXT NOT NULL,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id),
                    agent_name TEXT NOT NULL,
                    scopes TEXT NOT NULL DEFAULT '[]',
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    is_revoked BOOLEAN NOT NULL DEFAULT FALSE,
                    expires_at_ms BIGINT,
                    last_used_at_ms BIGINT,
                    usage_count BIGINT NOT NULL DEFAULT 0,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    deleted_at TIMESTAMPTZ
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_access_keys_hash
                    ON agent_access_keys(key_hash) WHERE deleted_at IS NULL;
                CREATE TABLE IF NOT EXISTS guardrails (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    category TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    deleted_at TIMESTAMPTZ
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_guardrails_kind
                    ON guardrails(kind) WHERE deleted_at IS NULL;
                CREATE TABLE IF NOT EXISTS policies (
                    id TEXT PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    workspace_id TEXT,
                    agent_id TEXT,
                    guardrail_kind TEXT NOT NULL,
                    action TEXT NOT NULL,
                    config TEXT NOT NULL DEFAULT '{}',
                    priority INTEGER NOT NULL DEFAULT 0,
                    enabled BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    deleted_at TIMESTAMPTZ
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_policies_scope
                    ON policies(tenant_id, COALESCE(workspace_id, ''), COALESCE(agent_id, ''), guardrail_kind)
                    WHERE deleted_at IS NULL;
                CREATE TABLE IF NOT EXISTS audit_decisions (
                    decision_id TEXT PRIMARY KEY,
                    request_id TEXT NOT NULL,
                    tenant_id TEXT NOT NULL,
                    workspace_id TEXT NOT NULL,
                    agent_id TEXT NOT NULL,
                    direction TEXT NOT NULL,
                    method TEXT,
                    tool_name TEXT,
                    final_action TEXT NOT NULL,
                    events TEXT NOT NULL DEFAULT '[]',
                    processing_time_ms BIGINT NOT NULL DEFAULT 0,
                    created_at_ms BIGINT NOT NULL DEFAULT 0,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );",
            )
            .map_err(store_err)?;
        Ok(())
    }
}

impl GovernanceRepository for PgGovernanceRepository {
    fn find_access_key(&self, key_hash: &str) -> Result<Option<AccessKeyRow>, RepositoryError> {
        let mut client = self.client.lock();
        let row = client
            .query_opt(
                "SELECT id, key_hash, key_prefix, workspace_id, agent_name, scopes,
                        is_active, is_revoked, expires_at_ms, last_used_at_ms, usage_count
                 FROM agent_access_keys
                 WHERE key_hash = $1 AND deleted_at IS NULL",
                &[&key_hash],
            )
            .map_err(store_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let scopes: String = row.try_get(5).map_err(store_err)?;
        Ok(Some(AccessKeyRow {
            id: row.try_get(0).map_err(store_err)?,
            key_hash: row.try_get(1).map_err(store_err)?,
            key_prefix: row.try_get(2).map_err(store_err)?,
            workspace_id: row.try_get(3).map_err(store_err)?,
            agent_name: row.try_get(4).map_err(store_err)?,
            scopes: serde_json::from_str(&scopes).unwrap_or_default(),
            is_active: row.try_get(6).map_err(store_err)?,
            is_revoked: row.try_get(7).map_err(store_err)?,
            expires_at_ms: row.try_get(8).map_err(store_err)?,
            last_used_at_ms: row.try_get(9).map_err(store_err)?,
            usage_count: row.try_get::<_, i64>(10).map_err(store_err)?.max(0) as u64,
        }))
    }

    fn find_workspace(&self, workspace_id: &str) -> Result<Option<WorkspaceRow>, RepositoryError> {
        let mut client = self.client.lock();
        let row = client
            .query_opt(
                "SELECT id, tenant_id, name, upstream_url, fail_mode, decision_timeout_ms
                 FROM workspaces
                 WHERE id = $1 AND deleted_at IS NULL",
                &[&workspace_id],
            )
            .map_err(store_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let fail_mode: String = row.try_get(4).map_err(store_err)?;
        Ok(Some(WorkspaceRow {
            id: row.try_get(0).map_err(store_err)?,
            tenant_id: row.try_get(1).map_err(store_err)?,
            name: row.try_get(2).map_err(store_err)?,
            upstream_url: row.try_get(3).map_err(store_err)?,
            fail_mode: FailMode::parse(&fail_mode).unwrap_or(FailMode::Closed),
            decision_timeout_ms: row.try_get::<_, i64>(5).map_err(store_err)?.max(0) as u64,
        }))
    }

    fn policies_for(
        &self,
        tenant_id: &str,
        workspace_id: &str,
        agent_id: &str,
    ) -> Result<Vec<PolicyRecord>, RepositoryError> {
        let mut client = self.client.lock();
        let rows = client
            .query(
                "SELECT id, tenant_id, workspace_id, agent_id, guardrail_kind, action, config, priority, enabled
                 FROM policies
                 WHERE deleted_at IS NULL
                   AND enabled = TRUE
                   AND tenant_id = $1
                   AND (workspace_id IS NULL OR workspace_id = $2)
                   AND (agent_id IS NULL OR agent_id = $3)",
                &[&tenant_id, &workspace_id, &agent_id],
            )
            .map_err(store_err)?;
        let mut policies = Vec::new();
        for row in rows {
            let kind: String = row.try_get(4).map_err(store_err)?;
            let action: String = row.try_get(5).map_err(store_err)?;
            let config: String = row.try_get(6).map_err(store_err)?;
            policies.push(PolicyRecord {
                id: row.try_get(0).map_err(store_err)?,
                tenant_id: row.try_get(1).map_err(store_err)?,
                workspace_id: row.try_get(2).map_err(store_err)?,
                agent_id: row.try_get(3).map_err(store_err)?,
                guardrail: GuardrailKind::parse(&kind).unwrap_or(GuardrailKind::Rbac),
                action: PolicyAction::parse(&action).unwrap_or(PolicyAction::Block),
                config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
                priority: row.try_get(7).map_err(store_err)?,
                enabled: row.try_get(8).map_err(store_err)?,
            });
        }
        Ok(policies)
    }

    fn record_key_usage(&self, key_id: &str, at_ms: i64) -> Result<(), RepositoryError> {
        let mut client = self.client.lock();
        client
            .execute(
                "UPDATE agent_access_keys
                 SET last_used_at_ms = $2, usage_count = usage_count + 1, updated_at = NOW()
                 WHERE id = $1 AND deleted_at IS NULL",
                &[&key_id, &at_ms],
            )
            .map_err(store_err)?;
        Ok(())
    }

    fn insert_decision(&self, decision: &AuditDecision) -> Result<(), RepositoryError> {
        let events = serde_json::to_string(&decision.events).map_err(serialization_err)?;
        let mut client = self.client.lock();
        client
            .execute(
                "INSERT INTO audit_decisions
                    (decision_id, request_id, tenant_id, workspace_id, agent_id, direction,
                     method, tool_name, final_action, events, processing_time_ms, created_at_ms)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                &[
                    &decision.decision_id,
                    &decision.request_id,
                    &decision.tenant_id,
                    &decision.workspace_id,
                    &decision.agent_id,
                    &decision.direction.as_str(),
                    &decision.method,
                    &decision.tool_name,
                    &decision.final_action,
                    &events,
                    &(decision.processing_time_ms as i64),
                    &decision.created_at_ms,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    fn list_decisions(&self, limit: usize) -> Result<Vec<AuditDecision>, RepositoryError> {
        let mut client = self.client.lock();
        let rows = client
            .query(
                "SELECT decision_id, request_id, tenant_id, workspace_id, agent_id, direction,
                        method, tool_name, final_action, events, processing_time_ms, created_at_ms
                 FROM audit_decisions
                 ORDER BY created_at_ms DESC
                 LIMIT $1",
                &[&(limit as i64)],
            )
            .map_err(store_err)?;
        let mut decisions = Vec::new();
        for row in rows {
            let direction: String = row.try_get(5).map_err(store_err)?;
            let events: String = row.try_get(9).map_err(store_err)?;
            decisions.push(AuditDecision {
                decision_id: row.try_get(0).map_err(store_err)?,
                request_id: row.try_get(1).map_err(store_err)?,
                tenant_id: row.try_get(2).map_err(store_err)?,
                workspace_id: row.try_get(3).map_err(store_err)?,
                agent_id: row.try_get(4).map_err(store_err)?,
                direction: if direction == "response" {
                    Direction::Response
                } else {
                    Direction::Request
                },
                method: row.try_get(6).map_err(store_err)?,
                tool_name: row.try_get(7).map_err(store_err)?,
                final_action: row.try_get(8).map_err(store_err)?,
                events: serde_json::from_str(&events).unwrap_or_default(),
                processing_time_ms: row.try_get::<_, i64>(10).map_err(store_err)?.max(0) as u64,
                created_at_ms: row.try_get(11).map_err(store_err)?,
            });
        }
        Ok(decisions)
    }
}

fn store_err(err: postgres::Error) -> RepositoryError {
    RepositoryError::Store(err.to_string())
}

fn serialization_err(err: serde_json::Error) -> RepositoryError {
    RepositoryError::Serialization(err.to_string())
}
