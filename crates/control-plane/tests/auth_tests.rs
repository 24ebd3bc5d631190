use std::sync::Arc;

use control_plane::{
    hash_access_key, AccessKeyRow, AuthError, FailMode, InMemoryAuditSink,
    InMemoryGovernanceRepository, KeyAuthority, RepositoryKeyAuthority, WorkspaceRow,
};

fn seeded_repo() -> Arc<InMemoryGovernanceRepository> {
    let repo = InMemoryGovernanceRepository::shared();
    repo.insert_workspace(WorkspaceRow {
        id: "ws-1".to_string(),
        tenant_id: "tn-1".to_string(),
        name: "production".to_string(),
        upstream_url: "http://upstream.local/mcp".to_string(),
        fail_mode: FailMode::Closed,
        decision_timeout_ms: 5_000,
    });
    repo.insert_access_key(key_row("key-1", "wdn_alpha", false, false, None));
    repo
}

fn key_row(
    id: &str,
    token: &str,
    inactive: bool,
    revoked: bool,
    expires_at_ms: Option<i64>,
) -> AccessKeyRow {
    AccessKeyRow {
        id: id.to_string(),
        key_hash: hash_access_key(token),
        key_prefix: token.chars().take(8).collect(),
        workspace_id: "ws-1".to_string(),
        agent_name: "research-agent".to_string(),
        scopes: Vec::new(),
        is_active: !inactive,
        is_revoked: revoked,
        expires_at_ms,
        last_used_at_ms: None,
        usage_count: 0,
    }
}

fn authority(repo: Arc<InMemoryGovernanceRepository>) -> (RepositoryKeyAuthority, Arc<InMemoryAuditSink>) {
    let audit = InMemoryAuditSink::shared();
    (RepositoryKeyAuthority::new(repo, audit.clone()), audit)
}

#[test]
fn valid_key_derives_full_context() {
    let (authority, audit) = authority(seeded_repo());
    let ctx = authority
        .authenticate(Some("Bearer wdn_alpha"))
        .expect("context");
    assert_eq!(ctx.tenant_id, "tn-1");
    assert_eq!(ctx.workspace_id, "ws-1");
    assert_eq!(ctx.agent_id, "key-1");
    assert_eq!(ctx.agent_name, "research-agent");
    assert_eq!(ctx.upstream_url, "http://upstream.local/mcp");
    assert_eq!(ctx.fail_mode, FailMode::Closed);
    assert!(!ctx.request_id.is_empty());
    // usage update is fire-and-forget through the background channel
    assert_eq!(audit.usage_updates(), vec!["key-1".to_string()]);
}

#[test]
fn context_is_determined_by_token_hash() {
    let (authority, _) = authority(seeded_repo());
    let first = authority.authenticate(Some("Bearer wdn_alpha")).expect("ctx");
    let second = authority.authenticate(Some("Bearer wdn_alpha")).expect("ctx");
    assert_eq!(first.agent_id, second.agent_id);
    assert_eq!(first.workspace_id, second.workspace_id);
    // request ids stay per-request
    assert_ne!(first.request_id, second.request_id);
}

#[test]
fn missing_header_is_unauthorized() {
    let (authority, _) = authority(seeded_repo());
    assert!(matches!(
        authority.authenticate(None),
        Err(AuthError::Unauthorized(_))
    ));
}

#[test]
fn non_bearer_header_is_unauthorized() {
    let (authority, _) = authority(seeded_repo());
    assert!(matches!(
        authority.authenticate(Some("Basic d2FyZGVu")),
        Err(AuthError::Unauthorized(_))
    ));
    assert!(matches!(
        authority.authenticate(Some("Bearer ")),
        Err(AuthError::Unauthorized(_))
    ));
}

#[test]
fn unknown_key_is_unauthorized() {
    let (authority, _) = authority(seeded_repo());
    assert!(matches!(
        authority.authenticate(Some("Bearer wdn_other")),
        Err(AuthError::Unauthorized(_))
    ));
}

#[test]
fn inactive_revoked_and_expired_keys_are_rejected() {
    let repo = seeded_repo();
    repo.insert_access_key(key_row("key-inactive", "wdn_inactive", true, false, None));
    repo.insert_access_key(key_row("key-revoked", "wdn_revoked", false, true, None));
    repo.insert_access_key(key_row("key-expired", "wdn_expired", false, false, Some(1)));
    let (authority, _) = authority(repo);

    for token in ["wdn_inactive", "wdn_revoked", "wdn_expired"] {
        let result = authority.authenticate(Some(&format!("Bearer {token}")));
        assert!(
            matches!(result, Err(AuthError::Unauthorized(_))),
            "{token} should be rejected"
        );
    }
}

#[test]
fn hash_is_stable_hex_sha256() {
    let hash = hash_access_key("wdn_alpha");
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, hash_access_key("wdn_alpha"));
    assert_ne!(hash, hash_access_key("wdn_beta"));
}
