use crate::domain::flow_definition::{FlowId, NodeId};
use crate::EngineError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Variable names the engine seeds from the contact; user input may not overwrite them
pub const RESERVED_VARIABLES: [&str; 2] = ["name", "waId"];

/// Value object: Execution ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value object: Contact ID (the WhatsApp number that owns the conversation)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId(pub String);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The contact an inbound event belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRef {
    /// WhatsApp ID (phone number)
    pub wa_id: String,

    /// Display name
    pub name: String,
}

impl ContactRef {
    /// The contact's identity as stored on executions
    pub fn contact_id(&self) -> ContactId {
        ContactId(self.wa_id.clone())
    }
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Execution is advancing through nodes
    Running,

    /// Suspended at a GetUserInput or user-response condition node
    WaitingForReply,

    /// Suspended at an AddButtons node
    WaitingForButton,

    /// Suspended at an AddDelay node
    WaitingForDelay,

    /// Execution reached a node with no further edge
    Completed,

    /// Execution failed
    Failed,
}

impl ExecutionStatus {
    /// Terminal statuses release the per-contact flow slot
    pub fn is_active(&self) -> bool {
        !matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Whether the execution is suspended waiting for an external event
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::WaitingForReply
                | ExecutionStatus::WaitingForButton
                | ExecutionStatus::WaitingForDelay
        )
    }
}

/// Aggregate: one contact's progress through one flow.
///
/// The full state survives process restarts: everything needed to resume is
/// serialized, nothing lives only in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    /// Unique identifier
    pub id: ExecutionId,

    /// Flow definition ID
    pub flow_id: FlowId,

    /// Definition version pinned at creation; later edits never affect this execution
    pub flow_version: u32,

    /// Contact that owns this execution
    pub contact_id: ContactId,

    /// Node the execution is at (the suspended node while waiting)
    pub current_node_id: NodeId,

    /// Accumulated variables
    pub variables: HashMap<String, Value>,

    /// Current status
    pub status: ExecutionStatus,

    /// Error message if the execution failed
    pub failure_reason: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last meaningful progress; drives inactivity abandonment
    pub last_activity_at: DateTime<Utc>,
}

impl ExecutionState {
    /// Create a new execution positioned at the flow's start node, with the
    /// contact's profile pre-seeded into the variable store.
    pub fn new(
        flow_id: FlowId,
        flow_version: u32,
        contact: &ContactRef,
        start_node_id: NodeId,
    ) -> Self {
        let now = Utc::now();
        let mut variables = HashMap::new();
        variables.insert("name".to_string(), Value::String(contact.name.clone()));
        variables.insert("waId".to_string(), Value::String(contact.wa_id.clone()));

        Self {
            id: ExecutionId(Uuid::new_v4().to_string()),
            flow_id,
            flow_version,
            contact_id: contact.contact_id(),
            current_node_id: start_node_id,
            variables,
            status: ExecutionStatus::Running,
            failure_reason: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Refresh `last_activity_at`
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Set a variable unconditionally (API response mappings use this)
    pub fn set_variable(&mut self, key: &str, value: Value) {
        self.variables.insert(key.to_string(), value);
    }

    /// Set a variable from user input. Reserved keys are refused: the write
    /// is skipped and logged rather than failing the flow.
    pub fn set_user_variable(&mut self, key: &str, value: Value) {
        if RESERVED_VARIABLES.contains(&key) {
            tracing::warn!(
                execution_id = %self.id,
                variable = key,
                "Refusing to overwrite reserved variable from user input"
            );
            return;
        }
        self.variables.insert(key.to_string(), value);
    }

    /// Suspend at the current node
    pub fn suspend(&mut self, waiting: ExecutionStatus) -> Result<(), EngineError> {
        if !waiting.is_waiting() {
            return Err(EngineError::InvalidTransition(format!(
                "{:?} is not a waiting status",
                waiting
            )));
        }
        if self.status != ExecutionStatus::Running {
            return Err(EngineError::InvalidTransition(format!(
                "Cannot suspend execution in state: {:?}",
                self.status
            )));
        }

        self.status = waiting;
        self.touch();
        Ok(())
    }

    /// Resume a suspended execution
    pub fn resume(&mut self) -> Result<(), EngineError> {
        if !self.status.is_waiting() {
            return Err(EngineError::InvalidTransition(format!(
                "Cannot resume execution in state: {:?}",
                self.status
            )));
        }

        self.status = ExecutionStatus::Running;
        self.touch();
        Ok(())
    }

    /// Complete the execution
    pub fn complete(&mut self) -> Result<(), EngineError> {
        if self.status != ExecutionStatus::Running {
            return Err(EngineError::InvalidTransition(format!(
                "Cannot complete execution in state: {:?}",
                self.status
            )));
        }

        self.status = ExecutionStatus::Completed;
        self.touch();
        Ok(())
    }

    /// Fail the execution, retaining the reason
    pub fn fail(&mut self, reason: String) -> Result<(), EngineError> {
        if !self.status.is_active() {
            return Err(EngineError::InvalidTransition(format!(
                "Cannot fail execution in state: {:?}",
                self.status
            )));
        }

        self.status = ExecutionStatus::Failed;
        self.failure_reason = Some(reason);
        self.touch();
        Ok(())
    }

    /// An active execution idle past the window no longer holds its slot
    pub fn is_abandoned(&self, window: Duration) -> bool {
        self.status.is_active() && Utc::now() - self.last_activity_at > window
    }
}
