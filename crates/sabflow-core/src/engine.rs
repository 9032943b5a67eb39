//! The event-driven flow interpreter.
//!
//! [`FlowEngine::advance`] is the single entry point: every inbound message,
//! button tap, and delay expiry goes through it. The engine loads state from
//! the repositories, runs the execution as far as it can go synchronously,
//! persists it, and returns. Between events nothing is held in memory, so a
//! process restart between two events is invisible to the contact.

use crate::domain::execution::{ContactRef, ExecutionId, ExecutionState, ExecutionStatus};
use crate::domain::flow_definition::FlowDefinition;
use crate::domain::repository::{DelayScheduler, ExecutionRepository, FlowDefinitionRepository};
use crate::executors::{self, NodeContext, NodeOutcome, ResumeOutcome, ResumeSignal, WaitKind};
use crate::{ApiClient, EngineError, Transport};
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// An external event offered to the engine
#[derive(Debug, Clone)]
pub enum TriggerEvent {
    /// The contact sent a text message
    InboundMessage {
        /// Sender
        contact: ContactRef,
        /// Message text
        text: String,
    },

    /// The contact tapped a quick-reply button
    ButtonClick {
        /// Sender
        contact: ContactRef,
        /// Zero-based position of the tapped button
        button_index: usize,
    },

    /// A scheduled delay passed
    DelayElapsed {
        /// The suspended execution the timer belongs to
        execution_id: ExecutionId,
    },
}

/// What the engine did with an event
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The event matched nothing; the caller may hand it to other handlers
    Unhandled,

    /// The event reached a suspended execution but did not wake it
    /// (e.g. a button index with no matching button)
    StillWaiting(ExecutionId),

    /// The execution ran and suspended again
    Suspended(ExecutionId, ExecutionStatus),

    /// The execution ran to completion
    Completed(ExecutionId),

    /// The execution failed; the reason is retained on the stored state
    Failed(ExecutionId, String),
}

/// Per-invocation engine policy
#[derive(Debug, Clone)]
pub struct RunPolicy {
    /// Master switch; when off, every event is `Unhandled`
    pub automation_enabled: bool,

    /// Idle time after which an active execution no longer holds its slot
    pub inactivity_window: ChronoDuration,

    /// Maximum nodes one event may execute synchronously before the
    /// execution is failed as a runaway loop
    pub max_chain_length: u32,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            automation_enabled: true,
            inactivity_window: ChronoDuration::hours(24),
            max_chain_length: 50,
        }
    }
}

/// The flow execution engine
pub struct FlowEngine {
    flows: Arc<dyn FlowDefinitionRepository>,
    executions: Arc<dyn ExecutionRepository>,
    scheduler: Arc<dyn DelayScheduler>,
    transport: Arc<dyn Transport>,
    api: Arc<dyn ApiClient>,

    // Serializes event handling per contact; two live event sources
    // (messages and timers) can race for the same execution. Entries are
    // evicted on guard drop, see [`ContactGuard`].
    contact_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FlowEngine {
    /// Create an engine over the given repositories and collaborators
    pub fn new(
        flows: Arc<dyn FlowDefinitionRepository>,
        executions: Arc<dyn ExecutionRepository>,
        scheduler: Arc<dyn DelayScheduler>,
        transport: Arc<dyn Transport>,
        api: Arc<dyn ApiClient>,
    ) -> Self {
        Self {
            flows,
            executions,
            scheduler,
            transport,
            api,
            contact_locks: DashMap::new(),
        }
    }

    /// Offer an event to the engine
    pub async fn advance(
        &self,
        event: TriggerEvent,
        policy: &RunPolicy,
    ) -> Result<ExecutionOutcome, EngineError> {
        if !policy.automation_enabled {
            tracing::debug!("Automation disabled, ignoring event");
            return Ok(ExecutionOutcome::Unhandled);
        }

        match event {
            TriggerEvent::InboundMessage { contact, text } => {
                self.handle_message(&contact, &text, policy).await
            }
            TriggerEvent::ButtonClick {
                contact,
                button_index,
            } => self.handle_button(&contact, button_index, policy).await,
            TriggerEvent::DelayElapsed { execution_id } => {
                self.handle_delay_elapsed(&execution_id, policy).await
            }
        }
    }

    async fn handle_message(
        &self,
        contact: &ContactRef,
        text: &str,
        policy: &RunPolicy,
    ) -> Result<ExecutionOutcome, EngineError> {
        let _guard = self.contact_guard(&contact.wa_id).await;

        // A suspended execution waiting for this contact's reply takes
        // precedence over starting a new flow: "hi" mid-conversation is an
        // answer, not a trigger.
        let waiting = self
            .executions
            .find_waiting_for_contact(&contact.contact_id())
            .await?;
        let reply_target = waiting
            .into_iter()
            .filter(|e| {
                e.status == ExecutionStatus::WaitingForReply
                    && !e.is_abandoned(policy.inactivity_window)
            })
            .max_by_key(|e| e.last_activity_at);

        if let Some(execution) = reply_target {
            return self
                .resume(execution, ResumeSignal::Reply(text.to_string()), policy)
                .await;
        }

        // No one is waiting; try trigger keywords
        for definition in self.flows.find_all_latest().await? {
            if !definition.matches_trigger(text) {
                continue;
            }

            // No-interruption policy: an active, non-abandoned execution of
            // this flow keeps its slot
            if let Some(active) = self
                .executions
                .find_active(&contact.contact_id(), &definition.id)
                .await?
            {
                if !active.is_abandoned(policy.inactivity_window) {
                    tracing::debug!(
                        execution_id = %active.id,
                        flow_id = %definition.id,
                        "Trigger matched but an active execution holds the slot"
                    );
                    return Ok(ExecutionOutcome::Unhandled);
                }
                tracing::info!(
                    execution_id = %active.id,
                    flow_id = %definition.id,
                    "Previous execution abandoned, starting fresh"
                );
            }

            let start_node = match definition.start_node() {
                Some(node) => node,
                None => {
                    return Err(EngineError::Configuration(format!(
                        "Flow {} has no start node",
                        definition.id
                    )))
                }
            };

            let execution = ExecutionState::new(
                definition.id.clone(),
                definition.version,
                contact,
                start_node.id.clone(),
            );
            tracing::info!(
                execution_id = %execution.id,
                flow_id = %definition.id,
                flow_version = definition.version,
                contact_id = %execution.contact_id,
                "Starting flow execution"
            );
            self.executions.save(&execution).await?;

            return self.drive(&definition, execution, None, policy).await;
        }

        Ok(ExecutionOutcome::Unhandled)
    }

    async fn handle_button(
        &self,
        contact: &ContactRef,
        button_index: usize,
        policy: &RunPolicy,
    ) -> Result<ExecutionOutcome, EngineError> {
        let _guard = self.contact_guard(&contact.wa_id).await;

        let waiting = self
            .executions
            .find_waiting_for_contact(&contact.contact_id())
            .await?;
        let target = waiting
            .into_iter()
            .filter(|e| {
                e.status == ExecutionStatus::WaitingForButton
                    && !e.is_abandoned(policy.inactivity_window)
            })
            .max_by_key(|e| e.last_activity_at);

        match target {
            Some(execution) => {
                self.resume(execution, ResumeSignal::Button(button_index), policy)
                    .await
            }
            None => Ok(ExecutionOutcome::Unhandled),
        }
    }

    async fn handle_delay_elapsed(
        &self,
        execution_id: &ExecutionId,
        policy: &RunPolicy,
    ) -> Result<ExecutionOutcome, EngineError> {
        // Peek before locking to learn which contact to serialize on
        let peek = match self.executions.find_by_id(execution_id).await? {
            Some(execution) => execution,
            None => return Ok(ExecutionOutcome::Unhandled),
        };

        let _guard = self.contact_guard(&peek.contact_id.0).await;

        // Reload under the lock; the state may have moved since the peek
        let execution = match self.executions.find_by_id(execution_id).await? {
            Some(execution) => execution,
            None => return Ok(ExecutionOutcome::Unhandled),
        };

        if execution.status != ExecutionStatus::WaitingForDelay {
            // Late timer; the execution moved on without it
            tracing::debug!(
                execution_id = %execution.id,
                status = ?execution.status,
                "Ignoring delay expiry for execution that is not waiting on one"
            );
            return Ok(ExecutionOutcome::Unhandled);
        }

        self.resume(execution, ResumeSignal::DelayElapsed, policy)
            .await
    }

    /// Wake a suspended execution with a signal and run it forward
    async fn resume(
        &self,
        mut execution: ExecutionState,
        signal: ResumeSignal,
        policy: &RunPolicy,
    ) -> Result<ExecutionOutcome, EngineError> {
        let definition = self.load_pinned_definition(&execution).await?;

        let node = match definition.node(&execution.current_node_id) {
            Some(node) => node,
            None => {
                let reason = format!(
                    "Suspended at node {} which no longer exists in flow {} v{}",
                    execution.current_node_id, execution.flow_id, execution.flow_version
                );
                return self.fail_execution(execution, reason).await;
            }
        };

        let outcome = match executors::resume_node(node, signal, &mut execution) {
            Ok(ResumeOutcome::StillWaiting) => {
                // Nothing saved: state is unchanged, including last_activity_at
                return Ok(ExecutionOutcome::StillWaiting(execution.id));
            }
            Ok(ResumeOutcome::Outcome(outcome)) => outcome,
            // Stored status and node kind disagree; the execution is the
            // broken party, not the engine
            Err(err) => return self.fail_execution(execution, err.to_string()).await,
        };

        execution.resume()?;
        self.drive(&definition, execution, Some(outcome), policy)
            .await
    }

    /// Run an execution forward until it suspends, completes, or fails.
    ///
    /// `pending` carries the outcome produced by a resume; when `None` the
    /// loop starts by entering the current node.
    async fn drive(
        &self,
        definition: &FlowDefinition,
        mut execution: ExecutionState,
        mut pending: Option<NodeOutcome>,
        policy: &RunPolicy,
    ) -> Result<ExecutionOutcome, EngineError> {
        let mut steps: u32 = 0;

        loop {
            let outcome = match pending.take() {
                Some(outcome) => outcome,
                None => {
                    steps += 1;
                    if steps > policy.max_chain_length {
                        let reason = format!(
                            "Synchronous chain exceeded {} nodes; aborting probable loop",
                            policy.max_chain_length
                        );
                        return self.fail_execution(execution, reason).await;
                    }

                    let node = match definition.node(&execution.current_node_id) {
                        Some(node) => node,
                        None => {
                            let reason = format!(
                                "Node {} not found in flow {} v{}",
                                execution.current_node_id,
                                execution.flow_id,
                                execution.flow_version
                            );
                            return self.fail_execution(execution, reason).await;
                        }
                    };

                    let mut ctx = NodeContext {
                        execution: &mut execution,
                        transport: self.transport.as_ref(),
                        api: self.api.as_ref(),
                    };
                    match executors::enter_node(node, &mut ctx).await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            return self.fail_execution(execution, err.to_string()).await;
                        }
                    }
                }
            };

            match outcome {
                NodeOutcome::Next(handle) => {
                    match definition.edge_target(&execution.current_node_id, &handle) {
                        Some(target) => {
                            execution.current_node_id = target.clone();
                        }
                        None => {
                            // Dead end is normal termination, not an error
                            tracing::debug!(
                                execution_id = %execution.id,
                                node_id = %execution.current_node_id,
                                handle = %handle,
                                "No outgoing edge, completing execution"
                            );
                            execution.complete()?;
                            self.executions.save(&execution).await?;
                            tracing::info!(
                                execution_id = %execution.id,
                                flow_id = %execution.flow_id,
                                "Flow execution completed"
                            );
                            return Ok(ExecutionOutcome::Completed(execution.id));
                        }
                    }
                }
                NodeOutcome::Suspend(kind) => {
                    let status = match kind {
                        WaitKind::Reply => ExecutionStatus::WaitingForReply,
                        WaitKind::Button => ExecutionStatus::WaitingForButton,
                        WaitKind::Delay(_) => ExecutionStatus::WaitingForDelay,
                    };
                    execution.suspend(status)?;
                    // Persist before scheduling: a timer must never fire
                    // against unsaved state
                    self.executions.save(&execution).await?;
                    if let WaitKind::Delay(delay) = kind {
                        let timer_id = self.scheduler.schedule(&execution.id, delay).await?;
                        tracing::debug!(
                            execution_id = %execution.id,
                            timer_id = %timer_id,
                            delay_secs = delay.as_secs_f64(),
                            "Delay timer scheduled"
                        );
                    }
                    tracing::info!(
                        execution_id = %execution.id,
                        node_id = %execution.current_node_id,
                        status = ?status,
                        "Flow execution suspended"
                    );
                    return Ok(ExecutionOutcome::Suspended(execution.id, status));
                }
                NodeOutcome::Fail(reason) => {
                    return self.fail_execution(execution, reason).await;
                }
            }
        }
    }

    async fn fail_execution(
        &self,
        mut execution: ExecutionState,
        reason: String,
    ) -> Result<ExecutionOutcome, EngineError> {
        tracing::warn!(
            execution_id = %execution.id,
            flow_id = %execution.flow_id,
            reason = %reason,
            "Flow execution failed"
        );
        execution.fail(reason.clone())?;
        self.executions.save(&execution).await?;
        Ok(ExecutionOutcome::Failed(execution.id, reason))
    }

    async fn load_pinned_definition(
        &self,
        execution: &ExecutionState,
    ) -> Result<FlowDefinition, EngineError> {
        self.flows
            .find_version(&execution.flow_id, execution.flow_version)
            .await?
            .ok_or_else(|| {
                EngineError::FlowNotFound(format!(
                    "{} v{}",
                    execution.flow_id, execution.flow_version
                ))
            })
    }

    async fn contact_guard(&self, wa_id: &str) -> ContactGuard<'_> {
        let lock = self
            .contact_locks
            .entry(wa_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let permit = lock.lock_owned().await;
        ContactGuard {
            locks: &self.contact_locks,
            wa_id: wa_id.to_string(),
            _permit: permit,
        }
    }
}

/// Holds a contact's lock; dropping it evicts the table entry when no other
/// task is holding or waiting on the same contact, so the table stays
/// proportional to in-flight contacts rather than all contacts ever seen.
struct ContactGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    wa_id: String,
    _permit: OwnedMutexGuard<()>,
}

impl Drop for ContactGuard<'_> {
    fn drop(&mut self) {
        // 2 = the table's Arc plus the one inside our still-live permit.
        // Anything higher means another task has cloned the lock.
        self.locks
            .remove_if(&self.wa_id, |_, lock| Arc::strong_count(lock) == 2);
    }
}
