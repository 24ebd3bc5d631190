use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::policy::Direction;
use crate::repository::GovernanceRepository;

/// Outcome of one guardrail evaluation, embedded in the audit decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GuardrailEvent {
    pub guardrail_type: String,
    pub triggered: bool,
    pub action: String,
    pub details: Value,
}

/// The persisted record describing one direction's governance outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditDecision {
    pub decision_id: String,
    pub request_id: String,
    pub tenant_id: String,
    pub workspace_id: String,
    pub agent_id: String,
    pub direction: Direction,
    pub method: Option<String>,
    pub tool_name: Option<String>,
    pub final_action: String,
    pub events: Vec<GuardrailEvent>,
    pub processing_time_ms: u64,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug)]
pub enum AuditTask {
    Decision(AuditDecision),
    KeyUsage { key_id: String, at_ms: i64 },
}

/// Accepts audit work from the hot path. Implementations must never block
/// or fail the caller.
pub trait AuditSink: Send + Sync {
    fn submit(&self, task: AuditTask);
    fn dropped(&self) -> u64 {
        0
    }
}

/// Bounded in-process channel in front of the store. When the channel is
/// full the task is counted and dropped.
pub struct ChannelAuditEmitter {
    tx: mpsc::Sender<AuditTask>,
    dropped: AtomicU64,
}

impl ChannelAuditEmitter {
    pub fn bounded(capacity: usize) -> (Arc<Self>, AuditDrain) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let emitter = Arc::new(Self {
            tx,
            dropped: AtomicU64::new(0),
        });
        (emitter, AuditDrain { rx })
    }
}

impl AuditSink for ChannelAuditEmitter {
    fn submit(&self, task: AuditTask) {
        if self.tx.try_send(task).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Single consumer draining the audit channel into the repository.
/// Ordering holds within this process only.
pub struct AuditDrain {
    rx: mpsc::Receiver<AuditTask>,
}

impl AuditDrain {
    pub async fn run(mut self, repo: Arc<dyn GovernanceRepository>) {
        while let Some(task) = self.rx.recv().await {
            let result = match task {
                AuditTask::Decision(decision) => repo.insert_decision(&decision),
                AuditTask::KeyUsage { key_id, at_ms } => repo.record_key_usage(&key_id, at_ms),
            };
            if let Err(err) = result {
                warn!(error = %err, "audit drain write failed");
            }
        }
    }

    /// Drain whatever is already queued, then stop. Test helper.
    pub async fn run_until_idle(mut self, repo: Arc<dyn GovernanceRepository>) {
        while let Ok(task) = self.rx.try_recv() {
            let result = match task {
                AuditTask::Decision(decision) => repo.insert_decision(&decision),
                AuditTask::KeyUsage { key_id, at_ms } => repo.record_key_usage(&key_id, at_ms),
            };
            if let Err(err) = result {
                warn!(error = %err, "audit drain write failed");
            }
        }
    }
}

#[derive(Default)]
pub struct InMemoryAuditSink {
    decisions: Mutex<Vec<AuditDecision>>,
    usages: Mutex<Vec<String>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn decisions(&self) -> Vec<AuditDecision> {
        self.decisions.lock().clone()
    }

    pub fn usage_updates(&self) -> Vec<String> {
        self.usages.lock().clone()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn submit(&self, task: AuditTask) {
        match task {
            AuditTask::Decision(decision) => self.decisions.lock().push(decision),
            AuditTask::KeyUsage { key_id, .. } => self.usages.lock().push(key_id),
        }
    }
}
