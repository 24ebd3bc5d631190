use control_plane::{
    hash_access_key, AccessKeyRow, AuditDecision, Direction, FailMode, GovernanceRepository,
    GuardrailKind, PolicyAction, PolicyRecord, SqliteGovernanceRepository, TenantRow, WorkspaceRow,
};
use serde_json::json;

fn seeded() -> SqliteGovernanceRepository {
    let repo = SqliteGovernanceRepository::open_in_memory().expect("open");
    repo.ensure_schema().expect("schema");
    repo.insert_tenant(&TenantRow {
        id: "tn-1".to_string(),
        name: "acme".to_string(),
    })
    .expect("tenant");
    repo.insert_workspace(&WorkspaceRow {
        id: "ws-1".to_string(),
        tenant_id: "tn-1".to_string(),
        name: "production".to_string(),
        upstream_url: "http://upstream.local/mcp".to_string(),
        fail_mode: FailMode::Open,
        decision_timeout_ms: 4_000,
    })
    .expect("workspace");
    repo.insert_access_key(&AccessKeyRow {
        id: "key-1".to_string(),
        key_hash: hash_access_key("wdn_alpha"),
        key_prefix: "wdn_alph".to_string(),
        workspace_id: "ws-1".to_string(),
        agent_name: "research-agent".to_string(),
        scopes: vec!["tools".to_string()],
        is_active: true,
        is_revoked: false,
        expires_at_ms: None,
        last_used_at_ms: None,
        usage_count: 0,
    })
    .expect("key");
    repo
}

fn policy(
    id: &str,
    workspace: Option<&str>,
    agent: Option<&str>,
    guardrail: GuardrailKind,
) -> PolicyRecord {
    PolicyRecord {
        id: id.to_string(),
        tenant_id: "tn-1".to_string(),
        workspace_id: workspace.map(str::to_string),
        agent_id: agent.map(str::to_string),
        guardrail,
        action: PolicyAction::Block,
        config: json!({ "limit": 10 }),
        priority: 0,
        enabled: true,
    }
}

#[test]
fn access_key_round_trips_through_the_schema() {
    let repo = seeded();
    let key = repo
        .find_access_key(&hash_access_key("wdn_alpha"))
        .expect("query")
        .expect("row");
    assert_eq!(key.id, "key-1");
    assert_eq!(key.agent_name, "research-agent");
    assert_eq!(key.scopes, vec!["tools".to_string()]);
    assert!(key.is_active);
    assert!(!key.is_revoked);

    assert!(repo
        .find_access_key(&hash_access_key("wdn_missing"))
        .expect("query")
        .is_none());
}

#[test]
fn workspace_lookup_carries_fail_mode_and_timeout() {
    let repo = seeded();
    let workspace = repo.find_workspace("ws-1").expect("query").expect("row");
    assert_eq!(workspace.tenant_id, "tn-1");
    assert_eq!(workspace.fail_mode, FailMode::Open);
    assert_eq!(workspace.decision_timeout_ms, 4_000);
}

#[test]
fn soft_deleted_keys_are_invisible() {
    let repo = seeded();
    repo.soft_delete_access_key("key-1").expect("delete");
    assert!(repo
        .find_access_key(&hash_access_key("wdn_alpha"))
        .expect("query")
        .is_none());
}

#[test]
fn policies_match_at_every_applicable_scope() {
    let repo = seeded();
    repo.insert_policy(&policy("p-tenant", None, None, GuardrailKind::PiiEmail))
        .expect("insert");
    repo.insert_policy(&policy("p-ws", Some("ws-1"), None, GuardrailKind::Rbac))
        .expect("insert");
    repo.insert_policy(&policy(
        "p-agent",
        Some("ws-1"),
        Some("key-1"),
        GuardrailKind::RateLimitPerMinute,
    ))
    .expect("insert");
    repo.insert_policy(&policy(
        "p-other-ws",
        Some("ws-2"),
        None,
        GuardrailKind::PiiSsn,
    ))
    .expect("insert");

    let policies = repo.policies_for("tn-1", "ws-1", "key-1").expect("query");
    let mut ids: Vec<&str> = policies.iter().map(|policy| policy.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["p-agent", "p-tenant", "p-ws"]);
}

#[test]
fn soft_deleted_policies_are_excluded() {
    let repo = seeded();
    repo.insert_policy(&policy("p-1", None, None, GuardrailKind::Rbac))
        .expect("insert");
    repo.soft_delete_policy("p-1").expect("delete");
    assert!(repo.policies_for("tn-1", "ws-1", "key-1").expect("query").is_empty());
}

#[test]
fn key_usage_updates_accumulate() {
    let repo = seeded();
    repo.record_key_usage("key-1", 100).expect("usage");
    repo.record_key_usage("key-1", 200).expect("usage");
    let key = repo
        .find_access_key(&hash_access_key("wdn_alpha"))
        .expect("query")
        .expect("row");
    assert_eq!(key.usage_count, 2);
    assert_eq!(key.last_used_at_ms, Some(200));
}

#[test]
fn decisions_persist_with_events() {
    let repo = seeded();
    let decision = AuditDecision {
        decision_id: "dec_abc".to_string(),
        request_id: "req-1".to_string(),
        tenant_id: "tn-1".to_string(),
        workspace_id: "ws-1".to_string(),
        agent_id: "key-1".to_string(),
        direction: Direction::Response,
        method: Some("tools/call".to_string()),
        tool_name: Some("get_article".to_string()),
        final_action: "block".to_string(),
        events: vec![control_plane::GuardrailEvent {
            guardrail_type: "pii_ssn".to_string(),
            triggered: true,
            action: "block".to_string(),
            details: json!({ "total_findings": 1 }),
        }],
        processing_time_ms: 7,
        created_at_ms: 1_000,
    };
    repo.insert_decision(&decision).expect("insert");

    let decisions = repo.list_decisions(10).expect("list");
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].decision_id, "dec_abc");
    assert_eq!(decisions[0].direction, Direction::Response);
    assert_eq!(decisions[0].final_action, "block");
    assert_eq!(decisions[0].events.len(), 1);
    assert!(decisions[0].events[0].triggered);
}
