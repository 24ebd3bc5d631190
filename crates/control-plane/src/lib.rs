pub mod audit;
pub mod auth;
pub mod cache;
pub mod config;
pub mod pg_repository;
pub mod policy;
pub mod rate_counter;
pub mod redis_store;
pub mod repository;
pub mod resolver;
pub mod sqlite_repository;
pub mod static_config;

pub use audit::{
    AuditDecision, AuditDrain, AuditSink, AuditTask, ChannelAuditEmitter, GuardrailEvent,
    InMemoryAuditSink,
};
pub use auth::{
    extract_bearer, hash_access_key, AuthError, KeyAuthority, RepositoryKeyAuthority,
    RequestContext,
};
pub use cache::{InMemoryPolicyCache, PolicyCache};
pub use config::{ConfigError, SystemConfig, SystemConfigLoader};
pub use pg_repository::PgGovernanceRepository;
pub use policy::{
    policy_cache_key, Direction, EffectivePolicy, EffectivePolicySet, FailMode, GuardrailCategory,
    GuardrailKind, PolicyAction, PolicyLoadError, PolicyProvider, PolicyRecord,
};
pub use rate_counter::{CounterError, InMemoryRateCounterStore, RateCounterStore};
pub use redis_store::{RedisPolicyCache, RedisRateCounterStore, RedisStoreConfig};
pub use repository::{
    AccessKeyRow, GovernanceRepository, InMemoryGovernanceRepository, RepositoryError, TenantRow,
    WorkspaceRow,
};
pub use resolver::CachingPolicyResolver;
pub use sqlite_repository::SqliteGovernanceRepository;
