use std::sync::Arc;

use tracing::debug;

use crate::auth::RequestContext;
use crate::cache::PolicyCache;
use crate::policy::{
    policy_cache_key, EffectivePolicySet, PolicyLoadError, PolicyProvider,
};
use crate::repository::GovernanceRepository;

/// Repository-backed resolver with a TTL cache in front. A cache miss or
/// an unreachable cache falls through to the repository; repository
/// failure propagates so the caller can apply the workspace fail mode.
pub struct CachingPolicyResolver {
    repo: Arc<dyn GovernanceRepository>,
    cache: Arc<dyn PolicyCache>,
    ttl_seconds: u64,
}

impl CachingPolicyResolver {
    pub fn new(
        repo: Arc<dyn GovernanceRepository>,
        cache: Arc<dyn PolicyCache>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            repo,
            cache,
            ttl_seconds,
        }
    }

    /// Invalidation entry point for admin-surface writes.
    pub fn invalidate(&self, tenant_id: &str, workspace_id: &str, agent_id: &str) {
        self.cache
            .invalidate(&policy_cache_key(tenant_id, workspace_id, agent_id));
    }
}

impl PolicyProvider for CachingPolicyResolver {
    fn effective_policies(
        &self,
        ctx: &RequestContext,
    ) -> Result<EffectivePolicySet, PolicyLoadError> {
        let key = policy_cache_key(&ctx.tenant_id, &ctx.workspace_id, &ctx.agent_id);
        if let Some(set) = self.cache.get(&key) {
            debug!(request_id = %ctx.request_id, "policy cache hit");
            return Ok(set);
        }

        let records = self
            .repo
            .policies_for(&ctx.tenant_id, &ctx.workspace_id, &ctx.agent_id)
            .map_err(|err| PolicyLoadError::Store(err.to_string()))?;
        let set = EffectivePolicySet::resolve(&records);
        self.cache.put(&key, &set, self.ttl_seconds);
        debug!(
            request_id = %ctx.request_id,
            policies = records.len(),
            effective = set.entries.len(),
            "policy cache refreshed"
        );
        Ok(set)
    }
}
