use crate::domain::execution::{ContactId, ExecutionId, ExecutionState};
use crate::domain::flow_definition::{FlowDefinition, FlowId};
use crate::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Repository for flow definitions
#[async_trait]
pub trait FlowDefinitionRepository: Send + Sync {
    /// Find the latest version of a flow definition
    async fn find_latest(&self, id: &FlowId) -> Result<Option<FlowDefinition>, EngineError>;

    /// Find a specific version of a flow definition
    async fn find_version(
        &self,
        id: &FlowId,
        version: u32,
    ) -> Result<Option<FlowDefinition>, EngineError>;

    /// Save a flow definition
    async fn save(&self, definition: &FlowDefinition) -> Result<(), EngineError>;

    /// Latest version of every flow, for trigger matching
    async fn find_all_latest(&self) -> Result<Vec<FlowDefinition>, EngineError>;
}

/// Repository for execution state
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Find an execution by ID
    async fn find_by_id(&self, id: &ExecutionId) -> Result<Option<ExecutionState>, EngineError>;

    /// Persist an execution (insert or replace)
    async fn save(&self, execution: &ExecutionState) -> Result<(), EngineError>;

    /// Find the active (non-terminal) execution of a flow for a contact, if any
    async fn find_active(
        &self,
        contact_id: &ContactId,
        flow_id: &FlowId,
    ) -> Result<Option<ExecutionState>, EngineError>;

    /// Find a contact's suspended executions, across all flows
    async fn find_waiting_for_contact(
        &self,
        contact_id: &ContactId,
    ) -> Result<Vec<ExecutionState>, EngineError>;

    /// Mark active executions idle since before `cutoff` as failed.
    /// Returns how many were swept. Storage hygiene; the engine does not
    /// depend on this running.
    async fn purge_abandoned(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError>;
}

/// Schedules delayed resumption of suspended executions.
///
/// Implementations deliver a `DelayElapsed` event for the execution once the
/// delay passes; delivery may be late but never early.
#[async_trait]
pub trait DelayScheduler: Send + Sync {
    /// Schedule a wake-up; returns a timer ID usable for cancellation
    async fn schedule(
        &self,
        execution_id: &ExecutionId,
        delay: Duration,
    ) -> Result<String, EngineError>;

    /// Cancel a pending timer; cancelling an unknown or fired timer is a no-op
    async fn cancel(&self, timer_id: &str) -> Result<(), EngineError>;
}

/// In-memory repository implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory flow definition repository, all versions retained
    #[derive(Default)]
    pub struct MemoryFlowRepository {
        // Versions stored in save order; latest is the highest version number
        flows: DashMap<FlowId, Vec<FlowDefinition>>,
    }

    impl MemoryFlowRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl FlowDefinitionRepository for MemoryFlowRepository {
        async fn find_latest(&self, id: &FlowId) -> Result<Option<FlowDefinition>, EngineError> {
            Ok(self.flows.get(id).and_then(|versions| {
                versions.iter().max_by_key(|d| d.version).cloned()
            }))
        }

        async fn find_version(
            &self,
            id: &FlowId,
            version: u32,
        ) -> Result<Option<FlowDefinition>, EngineError> {
            Ok(self.flows.get(id).and_then(|versions| {
                versions.iter().find(|d| d.version == version).cloned()
            }))
        }

        async fn save(&self, definition: &FlowDefinition) -> Result<(), EngineError> {
            let mut versions = self.flows.entry(definition.id.clone()).or_default();
            versions.retain(|d| d.version != definition.version);
            versions.push(definition.clone());
            Ok(())
        }

        async fn find_all_latest(&self) -> Result<Vec<FlowDefinition>, EngineError> {
            let mut latest = Vec::new();
            for entry in self.flows.iter() {
                if let Some(d) = entry.value().iter().max_by_key(|d| d.version) {
                    latest.push(d.clone());
                }
            }
            Ok(latest)
        }
    }

    /// In-memory execution repository
    #[derive(Default)]
    pub struct MemoryExecutionRepository {
        executions: DashMap<ExecutionId, ExecutionState>,
    }

    impl MemoryExecutionRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of stored executions (terminal included)
        pub fn len(&self) -> usize {
            self.executions.len()
        }

        pub fn is_empty(&self) -> bool {
            self.executions.is_empty()
        }
    }

    #[async_trait]
    impl ExecutionRepository for MemoryExecutionRepository {
        async fn find_by_id(
            &self,
            id: &ExecutionId,
        ) -> Result<Option<ExecutionState>, EngineError> {
            Ok(self.executions.get(id).map(|e| e.clone()))
        }

        async fn save(&self, execution: &ExecutionState) -> Result<(), EngineError> {
            self.executions
                .insert(execution.id.clone(), execution.clone());
            Ok(())
        }

        async fn find_active(
            &self,
            contact_id: &ContactId,
            flow_id: &FlowId,
        ) -> Result<Option<ExecutionState>, EngineError> {
            Ok(self
                .executions
                .iter()
                .find(|e| {
                    e.contact_id == *contact_id
                        && e.flow_id == *flow_id
                        && e.status.is_active()
                })
                .map(|e| e.clone()))
        }

        async fn find_waiting_for_contact(
            &self,
            contact_id: &ContactId,
        ) -> Result<Vec<ExecutionState>, EngineError> {
            Ok(self
                .executions
                .iter()
                .filter(|e| e.contact_id == *contact_id && e.status.is_waiting())
                .map(|e| e.clone())
                .collect())
        }

        async fn purge_abandoned(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError> {
            let mut swept = 0;
            for mut entry in self.executions.iter_mut() {
                if entry.status.is_active() && entry.last_activity_at < cutoff {
                    // fail() accepts any active status
                    if entry.fail("Abandoned due to inactivity".to_string()).is_ok() {
                        swept += 1;
                    }
                }
            }
            Ok(swept)
        }
    }

    /// Delay scheduler that records timers without firing them.
    ///
    /// Tests drain pending timers manually and feed the resulting
    /// `DelayElapsed` events to the engine, keeping timing deterministic.
    #[derive(Default)]
    pub struct MemoryDelayScheduler {
        pending: DashMap<String, (ExecutionId, Duration)>,
        counter: AtomicU64,
    }

    impl MemoryDelayScheduler {
        /// Create a scheduler with no pending timers
        pub fn new() -> Self {
            Self::default()
        }

        /// Remove and return all pending timers, in schedule order
        pub fn drain(&self) -> Vec<(String, ExecutionId, Duration)> {
            let mut timers: Vec<_> = self
                .pending
                .iter()
                .map(|e| (e.key().clone(), e.value().0.clone(), e.value().1))
                .collect();
            timers.sort_by(|a, b| a.0.cmp(&b.0));
            self.pending.clear();
            timers
        }

        pub fn pending_count(&self) -> usize {
            self.pending.len()
        }
    }

    #[async_trait]
    impl DelayScheduler for MemoryDelayScheduler {
        async fn schedule(
            &self,
            execution_id: &ExecutionId,
            delay: Duration,
        ) -> Result<String, EngineError> {
            let timer_id = format!("timer-{:08}", self.counter.fetch_add(1, Ordering::SeqCst));
            self.pending
                .insert(timer_id.clone(), (execution_id.clone(), delay));
            Ok(timer_id)
        }

        async fn cancel(&self, timer_id: &str) -> Result<(), EngineError> {
            self.pending.remove(timer_id);
            Ok(())
        }
    }
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::memory::*;
    use super::*;
    use crate::domain::execution::{ContactRef, ExecutionStatus};
    use crate::domain::flow_definition::{Node, NodeId, NodeKind};
    use chrono::Duration as ChronoDuration;

    fn definition(id: &str, version: u32) -> FlowDefinition {
        FlowDefinition {
            id: FlowId(id.to_string()),
            name: id.to_string(),
            version,
            trigger_keywords: vec!["hi".to_string()],
            nodes: vec![Node {
                id: NodeId("start".to_string()),
                kind: NodeKind::Start,
            }],
            edges: vec![],
        }
    }

    fn execution(flow: &str, wa_id: &str) -> ExecutionState {
        let contact = ContactRef {
            wa_id: wa_id.to_string(),
            name: "Test".to_string(),
        };
        ExecutionState::new(
            FlowId(flow.to_string()),
            1,
            &contact,
            NodeId("start".to_string()),
        )
    }

    #[tokio::test]
    async fn test_flow_repository_versioning() {
        let repo = MemoryFlowRepository::new();
        let id = FlowId("welcome".to_string());

        repo.save(&definition("welcome", 1)).await.unwrap();
        repo.save(&definition("welcome", 3)).await.unwrap();
        repo.save(&definition("welcome", 2)).await.unwrap();

        let latest = repo.find_latest(&id).await.unwrap().unwrap();
        assert_eq!(latest.version, 3);

        let pinned = repo.find_version(&id, 2).await.unwrap().unwrap();
        assert_eq!(pinned.version, 2);

        assert!(repo.find_version(&id, 9).await.unwrap().is_none());
        assert!(repo
            .find_latest(&FlowId("missing".to_string()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_all_latest() {
        let repo = MemoryFlowRepository::new();
        repo.save(&definition("a", 1)).await.unwrap();
        repo.save(&definition("a", 2)).await.unwrap();
        repo.save(&definition("b", 1)).await.unwrap();

        let all = repo.find_all_latest().await.unwrap();
        assert_eq!(all.len(), 2);
        let a = all.iter().find(|d| d.id.0 == "a").unwrap();
        assert_eq!(a.version, 2);
    }

    #[tokio::test]
    async fn test_execution_repository_active_lookup() {
        let repo = MemoryExecutionRepository::new();
        let mut exec = execution("welcome", "111");
        repo.save(&exec).await.unwrap();

        let found = repo
            .find_active(&ContactId("111".to_string()), &FlowId("welcome".to_string()))
            .await
            .unwrap();
        assert!(found.is_some());

        // Terminal executions do not hold the slot
        exec.complete().unwrap();
        repo.save(&exec).await.unwrap();
        let found = repo
            .find_active(&ContactId("111".to_string()), &FlowId("welcome".to_string()))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_find_waiting_for_contact() {
        let repo = MemoryExecutionRepository::new();

        let mut waiting = execution("welcome", "111");
        waiting.suspend(ExecutionStatus::WaitingForReply).unwrap();
        repo.save(&waiting).await.unwrap();

        let running = execution("other", "111");
        repo.save(&running).await.unwrap();

        let other_contact = execution("welcome", "222");
        repo.save(&other_contact).await.unwrap();

        let found = repo
            .find_waiting_for_contact(&ContactId("111".to_string()))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, waiting.id);
    }

    #[tokio::test]
    async fn test_purge_abandoned() {
        let repo = MemoryExecutionRepository::new();

        let mut stale = execution("welcome", "111");
        stale.suspend(ExecutionStatus::WaitingForReply).unwrap();
        stale.last_activity_at = Utc::now() - ChronoDuration::hours(48);
        repo.save(&stale).await.unwrap();

        let fresh = execution("welcome", "222");
        repo.save(&fresh).await.unwrap();

        let cutoff = Utc::now() - ChronoDuration::hours(24);
        let swept = repo.purge_abandoned(cutoff).await.unwrap();
        assert_eq!(swept, 1);

        let swept_exec = repo.find_by_id(&stale.id).await.unwrap().unwrap();
        assert_eq!(swept_exec.status, ExecutionStatus::Failed);
        assert!(swept_exec
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("inactivity"));

        let untouched = repo.find_by_id(&fresh.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_delay_scheduler_records_and_cancels() {
        let scheduler = MemoryDelayScheduler::new();
        let exec_id = ExecutionId("e1".to_string());

        let t1 = scheduler
            .schedule(&exec_id, Duration::from_secs(5))
            .await
            .unwrap();
        let _t2 = scheduler
            .schedule(&exec_id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(scheduler.pending_count(), 2);

        scheduler.cancel(&t1).await.unwrap();
        assert_eq!(scheduler.pending_count(), 1);

        // Cancelling twice is a no-op
        scheduler.cancel(&t1).await.unwrap();

        let drained = scheduler.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1, exec_id);
        assert_eq!(drained[0].2, Duration::from_secs(10));
        assert_eq!(scheduler.pending_count(), 0);
    }
}
