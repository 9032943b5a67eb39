//! In-memory implementations of the SabFlow persistence and scheduling
//! traits, for development and single-process deployments.
//!
//! Unlike the dashmap-backed test repositories in `sabflow-core`, the delay
//! scheduler here actually fires: a background task polls pending timers and
//! emits `ExecutionId`s over a channel once their deadline passes. The caller
//! turns those into `TriggerEvent::DelayElapsed` events for the engine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sabflow_core::domain::repository::{
    DelayScheduler, ExecutionRepository, FlowDefinitionRepository,
};
use sabflow_core::{
    ContactId, EngineError, ExecutionId, ExecutionState, FlowDefinition, FlowId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

/// In-memory flow definition store, all versions retained
#[derive(Default)]
pub struct InMemoryFlowStore {
    flows: RwLock<HashMap<FlowId, Vec<FlowDefinition>>>,
}

impl InMemoryFlowStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowDefinitionRepository for InMemoryFlowStore {
    async fn find_latest(&self, id: &FlowId) -> Result<Option<FlowDefinition>, EngineError> {
        let flows = self.flows.read().await;
        Ok(flows
            .get(id)
            .and_then(|versions| versions.iter().max_by_key(|d| d.version).cloned()))
    }

    async fn find_version(
        &self,
        id: &FlowId,
        version: u32,
    ) -> Result<Option<FlowDefinition>, EngineError> {
        let flows = self.flows.read().await;
        Ok(flows
            .get(id)
            .and_then(|versions| versions.iter().find(|d| d.version == version).cloned()))
    }

    async fn save(&self, definition: &FlowDefinition) -> Result<(), EngineError> {
        let mut flows = self.flows.write().await;
        let versions = flows.entry(definition.id.clone()).or_default();
        versions.retain(|d| d.version != definition.version);
        versions.push(definition.clone());
        Ok(())
    }

    async fn find_all_latest(&self) -> Result<Vec<FlowDefinition>, EngineError> {
        let flows = self.flows.read().await;
        Ok(flows
            .values()
            .filter_map(|versions| versions.iter().max_by_key(|d| d.version).cloned())
            .collect())
    }
}

/// In-memory execution state store
#[derive(Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<ExecutionId, ExecutionState>>,
}

impl InMemoryExecutionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionStore {
    async fn find_by_id(&self, id: &ExecutionId) -> Result<Option<ExecutionState>, EngineError> {
        let executions = self.executions.read().await;
        Ok(executions.get(id).cloned())
    }

    async fn save(&self, execution: &ExecutionState) -> Result<(), EngineError> {
        let mut executions = self.executions.write().await;
        executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn find_active(
        &self,
        contact_id: &ContactId,
        flow_id: &FlowId,
    ) -> Result<Option<ExecutionState>, EngineError> {
        let executions = self.executions.read().await;
        Ok(executions
            .values()
            .find(|e| {
                e.contact_id == *contact_id && e.flow_id == *flow_id && e.status.is_active()
            })
            .cloned())
    }

    async fn find_waiting_for_contact(
        &self,
        contact_id: &ContactId,
    ) -> Result<Vec<ExecutionState>, EngineError> {
        let executions = self.executions.read().await;
        Ok(executions
            .values()
            .filter(|e| e.contact_id == *contact_id && e.status.is_waiting())
            .cloned()
            .collect())
    }

    async fn purge_abandoned(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut executions = self.executions.write().await;
        let mut swept = 0;
        for execution in executions.values_mut() {
            if execution.status.is_active() && execution.last_activity_at < cutoff {
                if execution
                    .fail("Abandoned due to inactivity".to_string())
                    .is_ok()
                {
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            tracing::info!(swept, "Purged abandoned executions");
        }
        Ok(swept)
    }
}

struct PendingTimer {
    execution_id: ExecutionId,
    fires_at: Instant,
}

/// Polling delay scheduler.
///
/// [`InMemoryDelayScheduler::new`] returns the scheduler and the receiving
/// end of its wake-up channel. Timers survive only as long as the process;
/// a durable deployment plugs in a different `DelayScheduler`.
pub struct InMemoryDelayScheduler {
    timers: Arc<RwLock<HashMap<String, PendingTimer>>>,
    counter: std::sync::atomic::AtomicU64,
}

impl InMemoryDelayScheduler {
    /// Create the scheduler and spawn its polling task.
    ///
    /// `poll_interval` bounds how late a timer can fire.
    pub fn new(poll_interval: Duration) -> (Self, mpsc::UnboundedReceiver<ExecutionId>) {
        let timers: Arc<RwLock<HashMap<String, PendingTimer>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        let poll_timers = timers.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let due: Vec<(String, ExecutionId)> = {
                    let timers = poll_timers.read().await;
                    timers
                        .iter()
                        .filter(|(_, t)| t.fires_at <= now)
                        .map(|(id, t)| (id.clone(), t.execution_id.clone()))
                        .collect()
                };
                if due.is_empty() {
                    continue;
                }
                {
                    let mut timers = poll_timers.write().await;
                    for (timer_id, _) in &due {
                        timers.remove(timer_id);
                    }
                }
                for (timer_id, execution_id) in due {
                    tracing::debug!(%timer_id, %execution_id, "Delay timer fired");
                    if tx.send(execution_id).is_err() {
                        // Receiver dropped; no one wants wake-ups any more
                        return;
                    }
                }
            }
        });

        (
            Self {
                timers,
                counter: std::sync::atomic::AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Number of timers not yet fired
    pub async fn pending_count(&self) -> usize {
        self.timers.read().await.len()
    }
}

#[async_trait]
impl DelayScheduler for InMemoryDelayScheduler {
    async fn schedule(
        &self,
        execution_id: &ExecutionId,
        delay: Duration,
    ) -> Result<String, EngineError> {
        let timer_id = format!(
            "timer-{:08}",
            self.counter
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
        );
        let mut timers = self.timers.write().await;
        timers.insert(
            timer_id.clone(),
            PendingTimer {
                execution_id: execution_id.clone(),
                fires_at: Instant::now() + delay,
            },
        );
        Ok(timer_id)
    }

    async fn cancel(&self, timer_id: &str) -> Result<(), EngineError> {
        let mut timers = self.timers.write().await;
        timers.remove(timer_id);
        Ok(())
    }
}
