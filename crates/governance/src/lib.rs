mod body;
mod forwarder;
mod guardrails;
mod jsonrpc;
mod pipeline;

pub use body::{collect_string_leaves, for_each_string_leaf, replace_in_string_leaves};
pub use forwarder::{
    build_upstream_url, EchoForwarder, ForwardError, ForwardOutcome, Forwarder, HeaderPolicy,
    UpstreamClient, UpstreamClientConfig, UpstreamRequest,
};
pub use guardrails::{
    EvalAction, EvaluationResult, Evaluator, GuardrailConfigError, ScanDirection,
};
pub use jsonrpc::{
    effective_tool_name, envelope_id, error_body, method, minimal_envelope, tool_name,
    GOVERNANCE_BLOCKED, UPSTREAM_ERROR, UPSTREAM_TIMEOUT,
};
pub use pipeline::{run_pipeline, FinalAction, PipelineOutcome};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use control_plane::{
    AuditDecision, AuditSink, AuditTask, AuthError, Direction, EffectivePolicySet, FailMode,
    GuardrailEvent, KeyAuthority, PolicyProvider, RateCounterStore, RequestContext,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub upstream_timeout_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream_timeout_seconds: 30,
        }
    }
}

/// One proxied request as it arrives from the server layer. Header names
/// are lowercased.
#[derive(Clone, Debug)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub client_ip: Option<String>,
}

#[derive(Debug)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// End-to-end per-request flow: authenticate, resolve policies, evaluate
/// the request, forward, evaluate the response, audit every terminal
/// state. All shared services come in as `Arc` handles created at
/// startup.
pub struct Gateway {
    config: GatewayConfig,
    authority: Arc<dyn KeyAuthority>,
    policies: Arc<dyn PolicyProvider>,
    counters: Arc<dyn RateCounterStore>,
    audit: Arc<dyn AuditSink>,
    forwarder: Arc<dyn Forwarder>,
    header_policy: HeaderPolicy,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        authority: Arc<dyn KeyAuthority>,
        policies: Arc<dyn PolicyProvider>,
        counters: Arc<dyn RateCounterStore>,
        audit: Arc<dyn AuditSink>,
        forwarder: Arc<dyn Forwarder>,
        header_policy: HeaderPolicy,
    ) -> Self {
        Self {
            config,
            authority,
            policies,
            counters,
            audit,
            forwarder,
            header_policy,
        }
    }

    pub async fn handle_proxy(&self, req: ProxyRequest) -> Result<ProxyResponse, GatewayError> {
        let started = Instant::now();
        let ctx = match self
            .authority
            .authenticate(req.headers.get("authorization").map(String::as_str))
        {
            Ok(ctx) => ctx,
            Err(AuthError::Unauthorized(reason)) => {
                return Err(GatewayError::Unauthorized(reason))
            }
            Err(AuthError::Store(detail)) => return Err(GatewayError::Internal(detail)),
        };
        info!(
            request_id = %ctx.request_id,
            tenant_id = %ctx.tenant_id,
            agent_id = %ctx.agent_id,
            method = %req.method,
            path = %req.path,
            "proxy request received"
        );

        let mut guard = DisconnectGuard::new(self.audit.clone(), &ctx);

        let set = match self.policies.effective_policies(&ctx) {
            Ok(set) => set,
            Err(err) => {
                warn!(
                    request_id = %ctx.request_id,
                    fail_mode = ctx.fail_mode.as_str(),
                    error = %err,
                    "policy load failed"
                );
                match ctx.fail_mode {
                    FailMode::Open => EffectivePolicySet::default(),
                    FailMode::Closed => {
                        let events = vec![GuardrailEvent {
                            guardrail_type: "policy_loader".to_string(),
                            triggered: true,
                            action: "block".to_string(),
                            details: json!({ "error": err.to_string() }),
                        }];
                        let decision = self.record_decision(
                            &ctx,
                            Direction::Request,
                            None,
                            None,
                            "block",
                            events,
                            started,
                        );
                        guard.disarm();
                        return Ok(governance_error(
                            403,
                            Value::Null,
                            GOVERNANCE_BLOCKED,
                            "Governance policies unavailable",
                            json!({
                                "decision_id": decision.decision_id,
                                "action": "block_request",
                                "guardrails_triggered": ["policy_loader"],
                            }),
                            base_headers(&ctx, Some(&decision.decision_id), None),
                        ));
                    }
                }
            }
        };

        let has_body = !req.body.is_empty();
        let json_content_type = req
            .headers
            .get("content-type")
            .map(|value| value.contains("json"))
            .unwrap_or(false);
        let parsed: Option<Value> = if has_body && json_content_type {
            serde_json::from_slice(&req.body).ok()
        } else {
            None
        };
        let request_envelope =
            parsed.unwrap_or_else(|| minimal_envelope(&req.method, &req.path));
        let mcp_id = envelope_id(&request_envelope);
        let mcp_method = method(&request_envelope).map(str::to_string);
        let mcp_tool = tool_name(&request_envelope);

        let outcome = run_pipeline(
            Direction::Request,
            &request_envelope,
            &ctx,
            &set,
            self.counters.as_ref(),
        );
        let request_decision = self.record_decision(
            &ctx,
            Direction::Request,
            mcp_method.clone(),
            mcp_tool.clone(),
            outcome.final_action.as_str(),
            outcome.events.clone(),
            started,
        );

        match outcome.final_action {
            FinalAction::Block | FinalAction::Throttle => {
                guard.disarm();
                return Ok(blocked_response(
                    &ctx,
                    Direction::Request,
                    &outcome,
                    mcp_id,
                    &request_decision.decision_id,
                    None,
                ));
            }
            FinalAction::Allow | FinalAction::Modify => {}
        }

        let forward_body = if has_body {
            match &outcome.transformed_body {
                Some(value) => match serde_json::to_vec(value) {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        guard.disarm();
                        return Err(GatewayError::Internal(err.to_string()));
                    }
                },
                None => Some(req.body.clone()),
            }
        } else {
            None
        };

        let upstream_req = UpstreamRequest {
            method: req.method.clone(),
            url: build_upstream_url(&ctx.upstream_url, &req.path, req.query.as_deref()),
            headers: self
                .header_policy
                .apply(&ctx, &req.headers, req.client_ip.as_deref()),
            body: forward_body,
        };
        let deadline = Duration::from_millis(ctx.decision_timeout_ms)
            + Duration::from_secs(self.config.upstream_timeout_seconds);
        let forwarded = match tokio::time::timeout(deadline, self.forwarder.send(&upstream_req))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout),
        };

        let forwarded = match forwarded {
            Ok(forwarded) => forwarded,
            Err(err) => {
                let (status, code, message, kind) = match &err {
                    ForwardError::Timeout => {
                        (504, UPSTREAM_TIMEOUT, "Upstream server timeout", "upstream_timeout")
                    }
                    ForwardError::Unavailable(_) | ForwardError::BadRequest(_) => (
                        502,
                        UPSTREAM_ERROR,
                        "Cannot reach upstream server",
                        "upstream_unavailable",
                    ),
                };
                warn!(
                    request_id = %ctx.request_id,
                    upstream_url = %upstream_req.url,
                    error = %err,
                    "upstream request failed"
                );
                let events = vec![GuardrailEvent {
                    guardrail_type: "upstream".to_string(),
                    triggered: true,
                    action: kind.to_string(),
                    details: json!({ "error": err.to_string() }),
                }];
                let decision = self.record_decision(
                    &ctx,
                    Direction::Response,
                    mcp_method.clone(),
                    mcp_tool.clone(),
                    kind,
                    events,
                    started,
                );
                guard.disarm();
                return Ok(governance_error(
                    status,
                    mcp_id,
                    code,
                    message,
                    json!({ "decision_id": decision.decision_id, "action": kind }),
                    base_headers(
                        &ctx,
                        Some(&request_decision.decision_id),
                        Some(&decision.decision_id),
                    ),
                ));
            }
        };

        let retry_events: Vec<GuardrailEvent> = (1..forwarded.attempts)
            .map(|attempt| GuardrailEvent {
                guardrail_type: "upstream".to_string(),
                triggered: false,
                action: "retry".to_string(),
                details: json!({ "attempt": attempt }),
            })
            .collect();

        let response_json: Option<Value> = if forwarded
            .headers
            .get("content-type")
            .map(|value| value.contains("json"))
            .unwrap_or(false)
        {
            serde_json::from_slice(&forwarded.body).ok()
        } else {
            None
        };

        let mut response_headers = forwarded.headers.clone();
        response_headers.insert("x-request-id".to_string(), ctx.request_id.clone());
        response_headers.insert(
            "x-request-decision-id".to_string(),
            request_decision.decision_id.clone(),
        );

        let Some(response_body) = response_json else {
            // Opaque upstream body: content-aware guardrails are skipped.
            let decision = self.record_decision(
                &ctx,
                Direction::Response,
                mcp_method,
                mcp_tool,
                FinalAction::Allow.as_str(),
                retry_events,
                started,
            );
            response_headers.insert(
                "x-response-decision-id".to_string(),
                decision.decision_id.clone(),
            );
            guard.disarm();
            return Ok(ProxyResponse {
                status: forwarded.status,
                headers: response_headers,
                body: forwarded.body,
            });
        };

        let response_outcome = run_pipeline(
            Direction::Response,
            &response_body,
            &ctx,
            &set,
            self.counters.as_ref(),
        );
        let mut events = retry_events;
        events.extend(response_outcome.events.iter().cloned());
        let response_decision = self.record_decision(
            &ctx,
            Direction::Response,
            mcp_method,
            mcp_tool,
            response_outcome.final_action.as_str(),
            events,
            started,
        );
        response_headers.insert(
            "x-response-decision-id".to_string(),
            response_decision.decision_id.clone(),
        );

        match response_outcome.final_action {
            FinalAction::Block | FinalAction::Throttle => {
                guard.disarm();
                Ok(blocked_response(
                    &ctx,
                    Direction::Response,
                    &response_outcome,
                    mcp_id,
                    &response_decision.decision_id,
                    Some(&request_decision.decision_id),
                ))
            }
            FinalAction::Modify => {
                let transformed = response_outcome
                    .transformed_body
                    .unwrap_or(response_body);
                let body = match serde_json::to_vec(&transformed) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        guard.disarm();
                        return Err(GatewayError::Internal(err.to_string()));
                    }
                };
                guard.disarm();
                Ok(ProxyResponse {
                    status: forwarded.status,
                    headers: response_headers,
                    body,
                })
            }
            FinalAction::Allow => {
                guard.disarm();
                Ok(ProxyResponse {
                    status: forwarded.status,
                    headers: response_headers,
                    body: forwarded.body,
                })
            }
        }
    }

    fn record_decision(
        &self,
        ctx: &RequestContext,
        direction: Direction,
        method: Option<String>,
        tool_name: Option<String>,
        final_action: &str,
        events: Vec<GuardrailEvent>,
        started: Instant,
    ) -> AuditDecision {
        let decision = AuditDecision {
            decision_id: short_decision_id(),
            request_id: ctx.request_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            workspace_id: ctx.workspace_id.clone(),
            agent_id: ctx.agent_id.clone(),
            direction,
            method,
            tool_name,
            final_action: final_action.to_string(),
            events,
            processing_time_ms: started.elapsed().as_millis() as u64,
            created_at_ms: unix_ms(),
        };
        self.audit.submit(AuditTask::Decision(decision.clone()));
        decision
    }
}

/// Emits a `client_disconnected` audit marker if the request future is
/// dropped before reaching a terminal state.
struct DisconnectGuard {
    audit: Arc<dyn AuditSink>,
    pending: Option<AuditDecision>,
}

impl DisconnectGuard {
    fn new(audit: Arc<dyn AuditSink>, ctx: &RequestContext) -> Self {
        let pending = AuditDecision {
            decision_id: short_decision_id(),
            request_id: ctx.request_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            workspace_id: ctx.workspace_id.clone(),
            agent_id: ctx.agent_id.clone(),
            direction: Direction::Request,
            method: None,
            tool_name: None,
            final_action: "client_disconnected".to_string(),
            events: vec![GuardrailEvent {
                guardrail_type: "gateway".to_string(),
                triggered: true,
                action: "client_disconnected".to_string(),
                details: json!({}),
            }],
            processing_time_ms: 0,
            created_at_ms: unix_ms(),
        };
        Self {
            audit,
            pending: Some(pending),
        }
    }

    fn disarm(&mut self) {
        self.pending = None;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if let Some(decision) = self.pending.take() {
            self.audit.submit(AuditTask::Decision(decision));
        }
    }
}

fn blocked_response(
    ctx: &RequestContext,
    direction: Direction,
    outcome: &PipelineOutcome,
    mcp_id: Value,
    decision_id: &str,
    request_decision_id: Option<&str>,
) -> ProxyResponse {
    let throttled = outcome.final_action == FinalAction::Throttle;
    let action = if throttled {
        "throttle"
    } else if direction == Direction::Request {
        "block_request"
    } else {
        "block_response"
    };
    let message = if throttled {
        "Rate limit exceeded".to_string()
    } else {
        let blocked_by = outcome.blocked_by.as_deref().unwrap_or("policy");
        match direction {
            Direction::Request => format!("Request blocked by governance policy: {blocked_by}"),
            Direction::Response => format!("Response blocked by governance policy: {blocked_by}"),
        }
    };
    let mut data = json!({
        "decision_id": decision_id,
        "action": action,
        "guardrails_triggered": outcome.triggered,
    });
    if let Some(retry_after) = outcome.retry_after_seconds {
        data["retry_after_seconds"] = json!(retry_after);
    }

    let status = if throttled { 429 } else { 403 };
    let mut headers = match direction {
        Direction::Request => base_headers(ctx, Some(decision_id), None),
        Direction::Response => base_headers(ctx, request_decision_id, Some(decision_id)),
    };
    if let Some(retry_after) = outcome.retry_after_seconds {
        headers.insert("retry-after".to_string(), retry_after.to_string());
    }
    governance_error(status, mcp_id, GOVERNANCE_BLOCKED, &message, data, headers)
}

fn governance_error(
    status: u16,
    mcp_id: Value,
    code: i64,
    message: &str,
    data: Value,
    headers: HashMap<String, String>,
) -> ProxyResponse {
    let body = error_body(mcp_id, code, message, data);
    let mut headers = headers;
    headers.insert("content-type".to_string(), "application/json".to_string());
    ProxyResponse {
        status,
        headers,
        body: serde_json::to_vec(&body).unwrap_or_default(),
    }
}

fn base_headers(
    ctx: &RequestContext,
    request_decision_id: Option<&str>,
    response_decision_id: Option<&str>,
) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("x-request-id".to_string(), ctx.request_id.clone());
    if let Some(decision_id) = request_decision_id {
        headers.insert("x-request-decision-id".to_string(), decision_id.to_string());
    }
    if let Some(decision_id) = response_decision_id {
        headers.insert(
            "x-response-decision-id".to_string(),
            decision_id.to_string(),
        );
    }
    headers
}

fn short_decision_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("dec_{}", &hex[..12])
}

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
