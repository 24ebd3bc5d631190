#[derive(Clone, Debug)]
pub struct StaticConfigItem {
    pub key: &'static str,
    pub description: &'static str,
    pub value_type: &'static str,
    pub default_value: &'static str,
}

pub static STATIC_CONFIG_TABLE: &[StaticConfigItem] = &[
    StaticConfigItem {
        key: "storage.dsn",
        description: "Primary database connection string (Postgres when set)",
        value_type: "string",
        default_value: "",
    },
    StaticConfigItem {
        key: "storage.sqlite_path",
        description: "SQLite database path (used when storage.dsn is empty)",
        value_type: "string",
        default_value: "warden.sqlite",
    },
    StaticConfigItem {
        key: "cache.redis_url",
        description: "Redis connection string for the policy cache and rate counters",
        value_type: "string",
        default_value: "",
    },
    StaticConfigItem {
        key: "upstream.timeout_seconds",
        description: "Per-request timeout for upstream MCP calls",
        value_type: "number",
        default_value: "30",
    },
    StaticConfigItem {
        key: "upstream.max_retries",
        description: "Maximum retry attempts for transient upstream failures",
        value_type: "number",
        default_value: "2",
    },
    StaticConfigItem {
        key: "upstream.max_keepalive_connections",
        description: "Idle keep-alive connections retained per upstream host",
        value_type: "number",
        default_value: "20",
    },
    StaticConfigItem {
        key: "upstream.max_connections",
        description: "Upper bound on concurrent upstream connections",
        value_type: "number",
        default_value: "100",
    },
    StaticConfigItem {
        key: "proxy.forward_authorization",
        description: "Forward the client Authorization header to upstream",
        value_type: "boolean",
        default_value: "false",
    },
    StaticConfigItem {
        key: "proxy.blocked_headers",
        description: "Comma-separated headers never forwarded upstream",
        value_type: "string",
        default_value: "cookie,set-cookie",
    },
    StaticConfigItem {
        key: "policy_cache.ttl_seconds",
        description: "TTL for memoised effective policy sets",
        value_type: "number",
        default_value: "10",
    },
    StaticConfigItem {
        key: "audit.queue_capacity",
        description: "Bounded audit channel size; overflow drops with a counter",
        value_type: "number",
        default_value: "1024",
    },
    StaticConfigItem {
        key: "server.user_agent",
        description: "User-Agent sent on upstream requests without one",
        value_type: "string",
        default_value: "warden-gateway",
    },
];
