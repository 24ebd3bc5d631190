use std::path::Path;
use std::sync::Arc;

use control_plane::{
    AuditDrain, AuditSink, CachingPolicyResolver, ChannelAuditEmitter, GovernanceRepository,
    InMemoryPolicyCache, InMemoryRateCounterStore, PgGovernanceRepository, PolicyCache,
    RateCounterStore, RedisPolicyCache, RedisRateCounterStore, RedisStoreConfig,
    RepositoryKeyAuthority, SqliteGovernanceRepository, SystemConfig, SystemConfigLoader,
};
use governance::{
    Gateway, GatewayConfig, HeaderPolicy, UpstreamClient, UpstreamClientConfig,
};
use redis::Client as RedisClient;

use crate::error::AppError;

pub struct AppState {
    pub config: SystemConfig,
    pub gateway: Gateway,
    pub repo: Arc<dyn GovernanceRepository>,
    pub audit: Arc<ChannelAuditEmitter>,
}

impl AppState {
    /// Wire the process-wide resources: the repository, the policy cache,
    /// the rate counter store, the audit channel, and the upstream pool.
    /// The returned drain must be spawned by the caller.
    pub fn from_config(config: SystemConfig) -> Result<(Self, AuditDrain), AppError> {
        let repo = build_repository(&config)?;
        let (cache, counters) = build_stores(&config)?;
        let (audit, drain) =
            ChannelAuditEmitter::bounded(config.get_u64("audit.queue_capacity") as usize);

        let audit_sink: Arc<dyn AuditSink> = audit.clone();
        let authority = Arc::new(RepositoryKeyAuthority::new(repo.clone(), audit_sink.clone()));
        let resolver = Arc::new(CachingPolicyResolver::new(
            repo.clone(),
            cache,
            config.get_u64("policy_cache.ttl_seconds"),
        ));
        let upstream_config = UpstreamClientConfig {
            timeout_seconds: config.get_u64("upstream.timeout_seconds"),
            max_retries: config.get_u64("upstream.max_retries") as u32,
            max_keepalive_connections: config.get_u64("upstream.max_keepalive_connections")
                as usize,
            max_connections: config.get_u64("upstream.max_connections") as usize,
            user_agent: config.get_string("server.user_agent"),
        };
        let header_policy = HeaderPolicy {
            forward_authorization: config.get_bool("proxy.forward_authorization"),
            blocked_headers: config.get_list("proxy.blocked_headers"),
        };
        let gateway = Gateway::new(
            GatewayConfig {
                upstream_timeout_seconds: upstream_config.timeout_seconds,
            },
            authority,
            resolver,
            counters,
            audit_sink,
            Arc::new(UpstreamClient::new(upstream_config)),
            header_policy,
        );

        Ok((
            Self {
                config,
                gateway,
                repo,
                audit,
            },
            drain,
        ))
    }
}

pub fn load_config(path: &Path) -> Result<SystemConfig, AppError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(SystemConfigLoader::from_str(&raw)?)
}

pub fn create_default_config(path: &Path) -> Result<(), AppError> {
    std::fs::write(path, default_config_template().as_bytes())?;
    Ok(())
}

pub fn default_config_template() -> String {
    let lines = [
        "storage = { dsn = \"\", sqlite_path = \"warden.sqlite\" }",
        "cache = { redis_url = \"\" }",
        "upstream = { timeout_seconds = 30, max_retries = 2 }",
        "proxy = { forward_authorization = false, blocked_headers = \"cookie,set-cookie\" }",
        "policy_cache = { ttl_seconds = 10 }",
        "audit = { queue_capacity = 1024 }",
    ];
    format!("{}\n", lines.join("\n"))
}

fn build_repository(config: &SystemConfig) -> Result<Arc<dyn GovernanceRepository>, AppError> {
    let dsn = config.get_string("storage.dsn");
    if dsn.trim().is_empty() {
        let path = config.get_string("storage.sqlite_path");
        let repo = SqliteGovernanceRepository::open(&path)?;
        repo.ensure_schema()?;
        return Ok(Arc::new(repo));
    }
    if let Some(path) = sqlite_path_from_dsn(&dsn) {
        let repo = SqliteGovernanceRepository::open(path)?;
        repo.ensure_schema()?;
        return Ok(Arc::new(repo));
    }
    let repo = PgGovernanceRepository::connect(&dsn)?;
    repo.ensure_schema()?;
    Ok(Arc::new(repo))
}

fn build_stores(
    config: &SystemConfig,
) -> Result<(Arc<dyn PolicyCache>, Arc<dyn RateCounterStore>), AppError> {
    let redis_url = config.get_string("cache.redis_url");
    if redis_url.trim().is_empty() {
        let cache: Arc<dyn PolicyCache> = InMemoryPolicyCache::shared();
        let counters: Arc<dyn RateCounterStore> = InMemoryRateCounterStore::shared();
        return Ok((cache, counters));
    }
    let client =
        RedisClient::open(redis_url).map_err(|err| AppError::internal(err.to_string()))?;
    let store_config = RedisStoreConfig::default();
    Ok((
        Arc::new(RedisPolicyCache::new(client.clone(), store_config.clone())),
        Arc::new(RedisRateCounterStore::new(client, store_config)),
    ))
}

fn sqlite_path_from_dsn(dsn: &str) -> Option<&str> {
    dsn.strip_prefix("sqlite://")
        .or_else(|| dsn.strip_prefix("sqlite:"))
}
