use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::audit::AuditDecision;
use crate::policy::{FailMode, GuardrailKind, PolicyAction, PolicyRecord};
use crate::repository::{
    AccessKeyRow, GovernanceRepository, RepositoryError, TenantRow, WorkspaceRow,
};

pub struct SqliteGovernanceRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGovernanceRepository {
    pub fn open(path: &str) -> Result<Self, RepositoryError> {
        let conn = Connection::open(path).map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn ensure_schema(&self) -> Result<(), RepositoryError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                deleted_at TEXT
            );
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                name TEXT NOT NULL,
                upstream_url TEXT NOT NULL,
                fail_mode TEXT NOT NULL DEFAULT 'closed',
                decision_timeout_ms INTEGER NOT NULL DEFAULT 5000,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                deleted_at TEXT
            );
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES tenants(id),
                email TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                deleted_at TEXT
            );
            CREATE TABLE IF NOT EXISTS agent_access_keys (
                id TEXT PRIMARY KEY,
                key_hash TEXT NOT NULL,
                key_prefix TEXT NOT NULL,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id),
                agent_name TEXT NOT NULL,
                scopes TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                is_revoked INTEGER NOT NULL DEFAULT 0,
                expires_at_ms INTEGER,
                last_used_at_ms INTEGER,
                usage_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                deleted_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_access_keys_hash
                ON agent_access_keys(key_hash) WHERE deleted_at IS NULL;
            CREATE TABLE IF NOT EXISTS guardrails (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                category TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                deleted_at TEXT
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
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                deleted_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_policies_scope
                ON policies(tenant_id, ifnull(workspace_id, ''), ifnull(agent_id, ''), guardrail_kind)
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
                processing_time_ms INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );",
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn insert_tenant(&self, tenant: &TenantRow) -> Result<(), RepositoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tenants (id, name) VALUES (?1, ?2)",
            params![tenant.id, tenant.name],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn insert_workspace(&self, workspace: &WorkspaceRow) -> Result<(), RepositoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO workspaces (id, tenant_id, name, upstream_url, fail_mode, decision_timeout_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                workspace.id,
                workspace.tenant_id,
                workspace.name,
                workspace.upstream_url,
                workspace.fail_mode.as_str(),
                workspace.decision_timeout_ms as i64,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn insert_access_key(&self, key: &AccessKeyRow) -> Result<(), RepositoryError> {
        let scopes = serde_json::to_string(&key.scopes).map_err(serialization_err)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_access_keys
                (id, key_hash, key_prefix, workspace_id, agent_name, scopes,
                 is_active, is_revoked, expires_at_ms, last_used_at_ms, usage_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                key.id,
                key.key_hash,
                key.key_prefix,
                key.workspace_id,
                key.agent_name,
                scopes,
                key.is_active,
                key.is_revoked,
                key.expires_at_ms,
                key.last_used_at_ms,
                key.usage_count as i64,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn insert_policy(&self, policy: &PolicyRecord) -> Result<(), RepositoryError> {
        let config = serde_json::to_string(&policy.config).map_err(serialization_err)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO policies
                (id, tenant_id, workspace_id, agent_id, guardrail_kind, action, config, priority, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                policy.id,
                policy.tenant_id,
                policy.workspace_id,
                policy.agent_id,
                policy.guardrail.as_str(),
                policy.action.as_str(),
                config,
                policy.priority,
                policy.enabled,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn soft_delete_policy(&self, policy_id: &str) -> Result<(), RepositoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE policies SET deleted_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND deleted_at IS NULL",
            params![policy_id],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn soft_delete_access_key(&self, key_id: &str) -> Result<(), RepositoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agent_access_keys SET deleted_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND deleted_at IS NULL",
            params![key_id],
        )
        .map_err(store_err)?;
        Ok(())
    }
}

impl GovernanceRepository for SqliteGovernanceRepository {
    fn find_access_key(&self, key_hash: &str) -> Result<Option<AccessKeyRow>, RepositoryError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, key_hash, key_prefix, workspace_id, agent_name, scopes,
                    is_active, is_revoked, expires_at_ms, last_used_at_ms, usage_count
             FROM agent_access_keys
             WHERE key_hash = ?1 AND deleted_at IS NULL",
            params![key_hash],
            access_key_from_row,
        )
        .optional()
        .map_err(store_err)
    }

    fn find_workspace(&self, workspace_id: &str) -> Result<Option<WorkspaceRow>, RepositoryError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, tenant_id, name, upstream_url, fail_mode, decision_timeout_ms
             FROM workspaces
             WHERE id = ?1 AND deleted_at IS NULL",
            params![workspace_id],
            workspace_from_row,
        )
        .optional()
        .map_err(store_err)
    }

    fn policies_for(
        &self,
        tenant_id: &str,
        workspace_id: &str,
        agent_id: &str,
    ) -> Result<Vec<PolicyRecord>, RepositoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, tenant_id, workspace_id, agent_id, guardrail_kind, action, config, priority, enabled
                 FROM policies
                 WHERE deleted_at IS NULL
                   AND enabled = 1
                   AND tenant_id = ?1
                   AND (workspace_id IS NULL OR workspace_id = ?2)
                   AND (agent_id IS NULL OR agent_id = ?3)",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![tenant_id, workspace_id, agent_id], policy_from_row)
            .map_err(store_err)?;
        let mut policies = Vec::new();
        for row in rows {
            policies.push(row.map_err(store_err)?);
        }
        Ok(policies)
    }

    fn record_key_usage(&self, key_id: &str, at_ms: i64) -> Result<(), RepositoryError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE agent_access_keys
             SET last_used_at_ms = ?2, usage_count = usage_count + 1, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND deleted_at IS NULL",
            params![key_id, at_ms],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn insert_decision(&self, decision: &AuditDecision) -> Result<(), RepositoryError> {
        let events = serde_json::to_string(&decision.events).map_err(serialization_err)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_decisions
                (decision_id, request_id, tenant_id, workspace_id, agent_id, direction,
                 method, tool_name, final_action, events, processing_time_ms, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                decision.decision_id,
                decision.request_id,
                decision.tenant_id,
                decision.workspace_id,
                decision.agent_id,
                decision.direction.as_str(),
                decision.method,
                decision.tool_name,
                decision.final_action,
                events,
                decision.processing_time_ms as i64,
                decision.created_at_ms,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn list_decisions(&self, limit: usize) -> Result<Vec<AuditDecision>, RepositoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT decision_id, request_id, tenant_id, workspace_id, agent_id, direction,
                        method, tool_name, final_action, events, processing_time_ms, created_at_ms
                 FROM audit_decisions
                 ORDER BY created_at_ms DESC
                 LIMIT ?1",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![limit as i64], decision_from_row)
            .map_err(store_err)?;
        let mut decisions = Vec::new();
        for row in rows {
            decisions.push(row.map_err(store_err)?);
        }
        Ok(decisions)
    }
}

fn access_key_from_row(row: &Row<'_>) -> rusqlite::Result<AccessKeyRow> {
    let scopes: String = row.get(5)?;
    Ok(AccessKeyRow {
        id: row.get(0)?,
        key_hash: row.get(1)?,
        key_prefix: row.get(2)?,
        workspace_id: row.get(3)?,
        agent_name: row.get(4)?,
        scopes: serde_json::from_str(&scopes).unwrap_or_default(),
        is_active: row.get(6)?,
        is_revoked: row.get(7)?,
        expires_at_ms: row.get(8)?,
        last_used_at_ms: row.get(9)?,
        usage_count: row.get::<_, i64>(10)?.max(0) as u64,
    })
}

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<WorkspaceRow> {
    let fail_mode: String = row.get(4)?;
    Ok(WorkspaceRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        upstream_url: row.get(3)?,
        fail_mode: FailMode::parse(&fail_mode).unwrap_or(FailMode::Closed),
        decision_timeout_ms: row.get::<_, i64>(5)?.max(0) as u64,
    })
}

fn policy_from_row(row: &Row<'_>) -> rusqlite::Result<PolicyRecord> {
    let kind: String = row.get(4)?;
    let action: String = row.get(5)?;
    let config: String = row.get(6)?;
    Ok(PolicyRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        workspace_id: row.get(2)?,
        agent_id: row.get(3)?,
        guardrail: GuardrailKind::parse(&kind).unwrap_or(GuardrailKind::Rbac),
        action: PolicyAction::parse(&action).unwrap_or(PolicyAction::Block),
        config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
        priority: row.get(7)?,
        enabled: row.get(8)?,
    })
}

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<AuditDecision> {
    let direction: String = row.get(5)?;
    let events: String = row.get(9)?;
    Ok(AuditDecision {
        decision_id: row.get(0)?,
        request_id: row.get(1)?,
        tenant_id: row.get(2)?,
        workspace_id: row.get(3)?,
        agent_id: row.get(4)?,
        direction: if direction == "response" {
            crate::policy::Direction::Response
        } else {
            crate::policy::Direction::Request
        },
        method: row.get(6)?,
        tool_name: row.get(7)?,
        final_action: row.get(8)?,
        events: serde_json::from_str(&events).unwrap_or_default(),
        processing_time_ms: row.get::<_, i64>(10)?.max(0) as u64,
        created_at_ms: row.get(11)?,
    })
}

fn store_err(err: rusqlite::Error) -> RepositoryError {
    RepositoryError::Store(err.to_string())
}

fn serialization_err(err: serde_json::Error) -> RepositoryError {
    RepositoryError::Serialization(err.to_string())
}
