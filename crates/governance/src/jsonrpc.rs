use serde_json::{json, Value};

/// JSON-RPC error codes surfaced by the gateway.
pub const GOVERNANCE_BLOCKED: i64 = -32001;
pub const UPSTREAM_TIMEOUT: i64 = -32002;
pub const UPSTREAM_ERROR: i64 = -32003;

pub fn method(body: &Value) -> Option<&str> {
    body.get("method").and_then(Value::as_str)
}

pub fn envelope_id(body: &Value) -> Value {
    body.get("id").cloned().unwrap_or(Value::Null)
}

/// Tool name for audit purposes: only `tools/call` envelopes carry one.
pub fn tool_name(body: &Value) -> Option<String> {
    if method(body)? != "tools/call" {
        return None;
    }
    body.get("params")
        .and_then(|params| params.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Name RBAC matches against: `params.name` for `tools/call`, the method
/// itself for everything else.
pub fn effective_tool_name(body: &Value) -> Option<String> {
    let method = method(body)?;
    if method == "tools/call" {
        tool_name(body)
    } else {
        Some(method.to_string())
    }
}

/// Stand-in envelope for bodies that are absent or not JSON, so RBAC and
/// rate limiting still see a method name.
pub fn minimal_envelope(http_method: &str, path: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": format!("{http_method}:{path}"),
    })
}

pub fn error_body(id: Value, code: i64, message: &str, data: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
            "data": data,
        },
    })
}
