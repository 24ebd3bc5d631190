use control_plane::{
    EffectivePolicy, FailMode, GuardrailKind, InMemoryRateCounterStore, PolicyAction,
    RequestContext,
};
use governance::{EvalAction, Evaluator};
use serde_json::{json, Value};

fn ctx() -> RequestContext {
    RequestContext {
        request_id: "req-1".to_string(),
        tenant_id: "tn-1".to_string(),
        workspace_id: "ws-1".to_string(),
        agent_id: "ag-1".to_string(),
        agent_name: "agent".to_string(),
        scopes: Vec::new(),
        upstream_url: "http://upstream.local".to_string(),
        fail_mode: FailMode::Closed,
        decision_timeout_ms: 5_000,
        received_at_ms: 0,
    }
}

fn content(kind: GuardrailKind, config: Value) -> Evaluator {
    Evaluator::from_policy(&EffectivePolicy {
        guardrail: kind,
        action: PolicyAction::Block,
        config,
    })
    .expect("evaluator")
}

fn evaluate(evaluator: &Evaluator, body: &Value) -> EvalAction {
    let counters = InMemoryRateCounterStore::new();
    evaluator.evaluate(body, &ctx(), &counters).action
}

#[test]
fn large_documents_block_on_oversize_string_leaves() {
    let evaluator = content(
        GuardrailKind::ContentLargeDocuments,
        json!({ "max_chars": 16 }),
    );
    let small = json!({ "result": { "text": "short" } });
    assert!(matches!(evaluate(&evaluator, &small), EvalAction::Allow));

    let large = json!({ "result": { "text": "a".repeat(17) } });
    assert!(matches!(evaluate(&evaluator, &large), EvalAction::Block));

    let nested = json!({ "result": { "items": [{ "body": "b".repeat(17) }] } });
    assert!(matches!(evaluate(&evaluator, &nested), EvalAction::Block));
}

#[test]
fn structured_data_blocks_on_row_count() {
    let evaluator = content(
        GuardrailKind::ContentStructuredData,
        json!({ "max_rows": 3 }),
    );
    let small = json!({ "result": { "rows": [1, 2, 3] } });
    assert!(matches!(evaluate(&evaluator, &small), EvalAction::Allow));

    let large = json!({ "result": { "rows": [1, 2, 3, 4] } });
    assert!(matches!(evaluate(&evaluator, &large), EvalAction::Block));
}

#[test]
fn source_code_blocks_fenced_text_over_the_limit() {
    let evaluator = content(
        GuardrailKind::ContentSourceCode,
        json!({ "max_chars": 32 }),
    );
    let fenced = format!("```rust\n{}\n```", "x".repeat(40));
    let body = json!({ "result": { "text": fenced } });
    assert!(matches!(evaluate(&evaluator, &body), EvalAction::Block));

    // prose of the same size is not code
    let prose = json!({ "result": { "text": "y".repeat(60) } });
    assert!(matches!(evaluate(&evaluator, &prose), EvalAction::Allow));

    let short_fence = json!({ "result": { "text": "```rust\nfn x() {}\n```" } });
    assert!(matches!(evaluate(&evaluator, &short_fence), EvalAction::Allow));
}

#[test]
fn source_code_blocks_tagged_code_objects() {
    let evaluator = content(
        GuardrailKind::ContentSourceCode,
        json!({ "max_chars": 10 }),
    );
    let body = json!({
        "result": {
            "content": [{ "type": "code", "text": "fn main() { println!(\"hello\"); }" }],
        },
    });
    assert!(matches!(evaluate(&evaluator, &body), EvalAction::Block));
}

#[test]
fn log_only_action_reports_without_blocking() {
    let evaluator = Evaluator::from_policy(&EffectivePolicy {
        guardrail: GuardrailKind::ContentLargeDocuments,
        action: PolicyAction::LogOnly,
        config: json!({ "max_chars": 4 }),
    })
    .expect("evaluator");
    let body = json!({ "result": { "text": "oversized" } });
    let result = evaluator.evaluate(&body, &ctx(), &InMemoryRateCounterStore::new());
    assert!(matches!(result.action, EvalAction::LogOnly));
    assert!(result.triggered);
}
