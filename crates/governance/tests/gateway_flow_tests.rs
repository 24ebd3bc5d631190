use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use control_plane::{
    hash_access_key, AccessKeyRow, CachingPolicyResolver, Direction, EffectivePolicySet, FailMode,
    GuardrailKind, InMemoryAuditSink, InMemoryGovernanceRepository, InMemoryPolicyCache,
    InMemoryRateCounterStore, PolicyAction, PolicyLoadError, PolicyProvider, PolicyRecord,
    RepositoryKeyAuthority, RequestContext, WorkspaceRow,
};
use governance::{
    EchoForwarder, ForwardError, ForwardOutcome, Forwarder, Gateway, GatewayConfig, GatewayError,
    HeaderPolicy, ProxyRequest, UpstreamRequest,
};
use serde_json::{json, Value};

struct StaticForwarder {
    status: u16,
    body: Vec<u8>,
    attempts: u32,
    calls: Arc<AtomicU32>,
}

impl StaticForwarder {
    fn json(body: Value) -> Self {
        Self {
            status: 200,
            body: body.to_string().into_bytes(),
            attempts: 1,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

#[async_trait]
impl Forwarder for StaticForwarder {
    async fn send(&self, _upstream: &UpstreamRequest) -> Result<ForwardOutcome, ForwardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Ok(ForwardOutcome {
            status: self.status,
            headers,
            body: self.body.clone(),
            attempts: self.attempts,
        })
    }
}

struct FailingForwarder {
    error: fn() -> ForwardError,
}

#[async_trait]
impl Forwarder for FailingForwarder {
    async fn send(&self, _upstream: &UpstreamRequest) -> Result<ForwardOutcome, ForwardError> {
        Err((self.error)())
    }
}

fn policy(guardrail: GuardrailKind, action: PolicyAction, config: Value) -> PolicyRecord {
    PolicyRecord {
        id: format!("p-{}", guardrail.as_str()),
        tenant_id: "tn-1".to_string(),
        workspace_id: None,
        agent_id: None,
        guardrail,
        action,
        config,
        priority: 0,
        enabled: true,
    }
}

struct Harness {
    gateway: Gateway,
    audit: Arc<InMemoryAuditSink>,
    counters: Arc<InMemoryRateCounterStore>,
    upstream_calls: Option<Arc<AtomicU32>>,
}

fn build_gateway(
    policies: Vec<PolicyRecord>,
    fail_mode: FailMode,
    forwarder: Arc<dyn Forwarder>,
    upstream_calls: Option<Arc<AtomicU32>>,
) -> Harness {
    let repo = InMemoryGovernanceRepository::shared();
    repo.insert_workspace(WorkspaceRow {
        id: "ws-1".to_string(),
        tenant_id: "tn-1".to_string(),
        name: "production".to_string(),
        upstream_url: "http://upstream.local/mcp".to_string(),
        fail_mode,
        decision_timeout_ms: 5_000,
    });
    repo.insert_access_key(AccessKeyRow {
        id: "ag-1".to_string(),
        key_hash: hash_access_key("wdn_alpha"),
        key_prefix: "wdn_alph".to_string(),
        workspace_id: "ws-1".to_string(),
        agent_name: "research-agent".to_string(),
        scopes: Vec::new(),
        is_active: true,
        is_revoked: false,
        expires_at_ms: None,
        last_used_at_ms: None,
        usage_count: 0,
    });
    for record in policies {
        repo.insert_policy(record);
    }

    let audit = InMemoryAuditSink::shared();
    let counters = InMemoryRateCounterStore::shared();
    let authority = Arc::new(RepositoryKeyAuthority::new(repo.clone(), audit.clone()));
    let resolver = Arc::new(CachingPolicyResolver::new(
        repo,
        InMemoryPolicyCache::shared(),
        10,
    ));
    let gateway = Gateway::new(
        GatewayConfig::default(),
        authority,
        resolver,
        counters.clone(),
        audit.clone(),
        forwarder,
        HeaderPolicy::default(),
    );
    Harness {
        gateway,
        audit,
        counters,
        upstream_calls,
    }
}

fn tool_call_request(tool: &str) -> ProxyRequest {
    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/call",
        "params": { "name": tool, "arguments": {} },
    });
    let mut headers = HashMap::new();
    headers.insert("authorization".to_string(), "Bearer wdn_alpha".to_string());
    headers.insert("content-type".to_string(), "application/json".to_string());
    ProxyRequest {
        method: "POST".to_string(),
        path: "/rpc".to_string(),
        query: None,
        headers,
        body: body.to_string().into_bytes(),
        client_ip: Some("203.0.113.7".to_string()),
    }
}

fn response_json(response: &governance::ProxyResponse) -> Value {
    serde_json::from_slice(&response.body).expect("json response")
}

#[tokio::test]
async fn round_trip_without_guardrails_preserves_bytes() {
    let harness = build_gateway(Vec::new(), FailMode::Closed, Arc::new(EchoForwarder), None);
    let request = tool_call_request("get_article");
    let sent = request.body.clone();

    let response = harness.gateway.handle_proxy(request).await.expect("response");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, sent);
    assert!(response.headers.contains_key("x-request-id"));
    assert!(response.headers.contains_key("x-request-decision-id"));
    assert!(response.headers.contains_key("x-response-decision-id"));

    let decisions = harness.audit.decisions();
    assert_eq!(decisions.len(), 2);
    assert_eq!(decisions[0].direction, Direction::Request);
    assert_eq!(decisions[0].final_action, "allow");
    assert_eq!(decisions[1].direction, Direction::Response);
    assert_eq!(decisions[1].final_action, "allow");
}

#[tokio::test]
async fn s1_ssn_in_upstream_response_blocks() {
    let upstream = StaticForwarder::json(json!({ "result": { "text": "SSN is 123-45-6789" } }));
    let harness = build_gateway(
        vec![policy(GuardrailKind::PiiSsn, PolicyAction::Block, json!({}))],
        FailMode::Closed,
        Arc::new(upstream),
        None,
    );

    let response = harness
        .gateway
        .handle_proxy(tool_call_request("get_article"))
        .await
        .expect("response");
    assert_eq!(response.status, 403);

    let body = response_json(&response);
    assert_eq!(body["error"]["code"], json!(-32001));
    assert_eq!(
        body["error"]["data"]["guardrails_triggered"],
        json!(["pii_ssn"])
    );
    assert_eq!(body["error"]["data"]["action"], json!("block_response"));

    let decisions = harness.audit.decisions();
    assert_eq!(decisions.len(), 2);
    assert_eq!(decisions[1].direction, Direction::Response);
    assert_eq!(decisions[1].final_action, "block");
    assert_eq!(decisions[1].tool_name.as_deref(), Some("get_article"));
}

#[tokio::test]
async fn s2_email_in_upstream_response_is_redacted() {
    let upstream =
        StaticForwarder::json(json!({ "result": { "text": "contact me at jane@example.com" } }));
    let harness = build_gateway(
        vec![policy(GuardrailKind::PiiEmail, PolicyAction::Redact, json!({}))],
        FailMode::Closed,
        Arc::new(upstream),
        None,
    );

    let response = harness
        .gateway
        .handle_proxy(tool_call_request("get_article"))
        .await
        .expect("response");
    assert_eq!(response.status, 200);
    let body = response_json(&response);
    assert_eq!(
        body["result"]["text"],
        json!("contact me at [REDACTED:EMAIL]")
    );

    let decisions = harness.audit.decisions();
    assert_eq!(decisions[1].final_action, "modify");
}

#[tokio::test]
async fn s3_rbac_denial_never_contacts_upstream() {
    let calls = Arc::new(AtomicU32::new(0));
    let upstream = StaticForwarder {
        status: 200,
        body: b"{}".to_vec(),
        attempts: 1,
        calls: calls.clone(),
    };
    let harness = build_gateway(
        vec![policy(
            GuardrailKind::Rbac,
            PolicyAction::Block,
            json!({
                "default_action": "deny",
                "allowed_tools": ["search_articles", "get_article"],
                "denied_tools": ["create_article"],
            }),
        )],
        FailMode::Closed,
        Arc::new(upstream),
        Some(calls.clone()),
    );

    let response = harness
        .gateway
        .handle_proxy(tool_call_request("create_article"))
        .await
        .expect("response");
    assert_eq!(response.status, 403);
    let body = response_json(&response);
    assert_eq!(body["error"]["code"], json!(-32001));
    assert_eq!(body["error"]["data"]["guardrails_triggered"], json!(["rbac"]));
    assert_eq!(body["error"]["data"]["action"], json!("block_request"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let decisions = harness.audit.decisions();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].direction, Direction::Request);
    assert_eq!(decisions[0].final_action, "block");
    let _ = harness.upstream_calls;
}

#[tokio::test]
async fn s4_rate_limit_allows_ten_then_throttles() {
    let harness = build_gateway(
        vec![policy(
            GuardrailKind::RateLimitPerMinute,
            PolicyAction::Throttle,
            json!({ "limit": 10 }),
        )],
        FailMode::Closed,
        Arc::new(EchoForwarder),
        None,
    );

    let mut allowed = 0;
    let mut throttled = 0;
    for _ in 0..12 {
        let response = harness
            .gateway
            .handle_proxy(tool_call_request("get_article"))
            .await
            .expect("response");
        match response.status {
            200 => allowed += 1,
            429 => {
                throttled += 1;
                assert!(response.headers.contains_key("retry-after"));
                let body = response_json(&response);
                assert_eq!(body["error"]["code"], json!(-32001));
                assert_eq!(body["error"]["data"]["action"], json!("throttle"));
                assert!(body["error"]["data"]["retry_after_seconds"].is_u64());
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(allowed, 10);
    assert_eq!(throttled, 2);
}

#[tokio::test]
async fn s5_credit_card_block_wins_over_email_redact() {
    let upstream = StaticForwarder::json(json!({
        "result": { "text": "card 4111 1111 1111 1111, contact jane@example.com" },
    }));
    let harness = build_gateway(
        vec![
            policy(GuardrailKind::PiiCreditCard, PolicyAction::Block, json!({})),
            policy(GuardrailKind::PiiEmail, PolicyAction::Redact, json!({})),
        ],
        FailMode::Closed,
        Arc::new(upstream),
        None,
    );

    let response = harness
        .gateway
        .handle_proxy(tool_call_request("get_article"))
        .await
        .expect("response");
    assert_eq!(response.status, 403);
    let body = response_json(&response);
    assert_eq!(
        body["error"]["data"]["guardrails_triggered"],
        json!(["pii_credit_card"])
    );

    // the block short-circuits before the email redactor runs
    let decisions = harness.audit.decisions();
    let response_decision = &decisions[1];
    assert_eq!(response_decision.final_action, "block");
    let triggered: Vec<&str> = response_decision
        .events
        .iter()
        .filter(|event| event.triggered)
        .map(|event| event.guardrail_type.as_str())
        .collect();
    assert_eq!(triggered, vec!["pii_credit_card"]);
}

#[tokio::test]
async fn s6_upstream_retries_are_audited() {
    let upstream = StaticForwarder::json(json!({ "result": { "text": "third time lucky" } }))
        .with_attempts(3);
    let harness = build_gateway(Vec::new(), FailMode::Closed, Arc::new(upstream), None);

    let response = harness
        .gateway
        .handle_proxy(tool_call_request("get_article"))
        .await
        .expect("response");
    assert_eq!(response.status, 200);

    let decisions = harness.audit.decisions();
    let retries: Vec<_> = decisions[1]
        .events
        .iter()
        .filter(|event| event.action == "retry")
        .collect();
    assert_eq!(retries.len(), 2);
}

#[tokio::test]
async fn counter_outage_fail_closed_throttles_fail_open_allows() {
    for (fail_mode, expected_status) in [(FailMode::Closed, 429), (FailMode::Open, 200)] {
        let harness = build_gateway(
            vec![policy(
                GuardrailKind::RateLimitPerMinute,
                PolicyAction::Throttle,
                json!({ "limit": 10 }),
            )],
            fail_mode,
            Arc::new(EchoForwarder),
            None,
        );
        harness.counters.set_unavailable(true);
        let response = harness
            .gateway
            .handle_proxy(tool_call_request("get_article"))
            .await
            .expect("response");
        assert_eq!(response.status, expected_status, "{fail_mode:?}");
    }
}

#[tokio::test]
async fn policy_load_failure_follows_fail_mode() {
    struct FailingResolver;
    impl PolicyProvider for FailingResolver {
        fn effective_policies(
            &self,
            _ctx: &RequestContext,
        ) -> Result<EffectivePolicySet, PolicyLoadError> {
            Err(PolicyLoadError::Store("database offline".to_string()))
        }
    }

    for (fail_mode, expected_status) in [(FailMode::Closed, 403), (FailMode::Open, 200)] {
        let repo = InMemoryGovernanceRepository::shared();
        repo.insert_workspace(WorkspaceRow {
            id: "ws-1".to_string(),
            tenant_id: "tn-1".to_string(),
            name: "production".to_string(),
            upstream_url: "http://upstream.local/mcp".to_string(),
            fail_mode,
            decision_timeout_ms: 5_000,
        });
        repo.insert_access_key(AccessKeyRow {
            id: "ag-1".to_string(),
            key_hash: hash_access_key("wdn_alpha"),
            key_prefix: "wdn_alph".to_string(),
            workspace_id: "ws-1".to_string(),
            agent_name: "research-agent".to_string(),
            scopes: Vec::new(),
            is_active: true,
            is_revoked: false,
            expires_at_ms: None,
            last_used_at_ms: None,
            usage_count: 0,
        });
        let audit = InMemoryAuditSink::shared();
        let gateway = Gateway::new(
            GatewayConfig::default(),
            Arc::new(RepositoryKeyAuthority::new(repo, audit.clone())),
            Arc::new(FailingResolver),
            InMemoryRateCounterStore::shared(),
            audit,
            Arc::new(EchoForwarder),
            HeaderPolicy::default(),
        );
        let response = gateway
            .handle_proxy(tool_call_request("get_article"))
            .await
            .expect("response");
        assert_eq!(response.status, expected_status, "{fail_mode:?}");
    }
}

#[tokio::test]
async fn upstream_timeout_maps_to_504_with_rpc_error() {
    let harness = build_gateway(
        Vec::new(),
        FailMode::Closed,
        Arc::new(FailingForwarder {
            error: || ForwardError::Timeout,
        }),
        None,
    );
    let response = harness
        .gateway
        .handle_proxy(tool_call_request("get_article"))
        .await
        .expect("response");
    assert_eq!(response.status, 504);
    let body = response_json(&response);
    assert_eq!(body["error"]["code"], json!(-32002));

    let decisions = harness.audit.decisions();
    assert_eq!(decisions[1].final_action, "upstream_timeout");
}

#[tokio::test]
async fn upstream_unreachable_maps_to_502_with_rpc_error() {
    let harness = build_gateway(
        Vec::new(),
        FailMode::Closed,
        Arc::new(FailingForwarder {
            error: || ForwardError::Unavailable("connection refused".to_string()),
        }),
        None,
    );
    let response = harness
        .gateway
        .handle_proxy(tool_call_request("get_article"))
        .await
        .expect("response");
    assert_eq!(response.status, 502);
    let body = response_json(&response);
    assert_eq!(body["error"]["code"], json!(-32003));
}

#[tokio::test]
async fn missing_key_is_unauthorized() {
    let harness = build_gateway(Vec::new(), FailMode::Closed, Arc::new(EchoForwarder), None);
    let mut request = tool_call_request("get_article");
    request.headers.remove("authorization");
    let result = harness.gateway.handle_proxy(request).await;
    assert!(matches!(result, Err(GatewayError::Unauthorized(_))));
}

#[tokio::test]
async fn request_redaction_rewrites_the_forwarded_body() {
    // The echo upstream returns what the gateway forwarded, so the
    // response shows the redacted request body.
    let harness = build_gateway(
        vec![policy(GuardrailKind::PiiEmail, PolicyAction::Redact, json!({}))],
        FailMode::Closed,
        Arc::new(EchoForwarder),
        None,
    );
    let body = json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "tools/call",
        "params": { "name": "send_note", "arguments": { "to": "jane@example.com" } },
    });
    let mut headers = HashMap::new();
    headers.insert("authorization".to_string(), "Bearer wdn_alpha".to_string());
    headers.insert("content-type".to_string(), "application/json".to_string());
    let request = ProxyRequest {
        method: "POST".to_string(),
        path: "/rpc".to_string(),
        query: None,
        headers,
        body: body.to_string().into_bytes(),
        client_ip: None,
    };

    let response = harness.gateway.handle_proxy(request).await.expect("response");
    assert_eq!(response.status, 200);
    let echoed = response_json(&response);
    assert_eq!(
        echoed["params"]["arguments"]["to"],
        json!("[REDACTED:EMAIL]")
    );
}
