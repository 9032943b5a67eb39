//! Per-node-type execution logic.
//!
//! [`enter_node`] runs when the interpreter arrives at a node and decides
//! whether the execution moves on, suspends, or fails. For nodes that
//! suspend, [`resume_node`] consumes the external event that wakes them.

mod api_call;
mod branching;
mod messaging;

use crate::domain::execution::ExecutionState;
use crate::domain::flow_definition::{Handle, Node, NodeKind};
use crate::{ApiClient, EngineError, Transport};
use std::time::Duration;

/// What a suspending node is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// A free-text reply from the contact
    Reply,

    /// A button tap
    Button,

    /// A delay timer, to be scheduled for this long
    Delay(Duration),
}

/// Result of entering a node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// Continue along the edge with this handle
    Next(Handle),

    /// Suspend the execution here
    Suspend(WaitKind),

    /// Fail the execution with this reason
    Fail(String),
}

/// The external event that wakes a suspended execution
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeSignal {
    /// The contact sent a text message
    Reply(String),

    /// The contact tapped the button at this position
    Button(usize),

    /// The scheduled delay passed
    DelayElapsed,
}

/// Result of offering a resume signal to a suspended node
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// The signal was consumed; proceed with this outcome
    Outcome(NodeOutcome),

    /// The signal did not match (e.g. an out-of-range button index);
    /// the execution stays suspended unchanged
    StillWaiting,
}

/// Everything a node executor may touch while running
pub struct NodeContext<'a> {
    /// The execution being advanced; executors read and write its variables
    pub execution: &'a mut ExecutionState,

    /// Outbound messaging
    pub transport: &'a dyn Transport,

    /// HTTP client for CallApi nodes
    pub api: &'a dyn ApiClient,
}

/// Run a node's entry action.
///
/// `Err` is reserved for engine-level faults; per-node failures that should
/// fail only this execution come back as `NodeOutcome::Fail`.
pub async fn enter_node(
    node: &Node,
    ctx: &mut NodeContext<'_>,
) -> Result<NodeOutcome, EngineError> {
    tracing::debug!(
        execution_id = %ctx.execution.id,
        node_id = %node.id,
        node_type = node.kind.type_name(),
        "Entering node"
    );

    match &node.kind {
        NodeKind::Start => Ok(NodeOutcome::Next(Handle::Main)),
        NodeKind::SendMessage(data) => messaging::send_message(data, ctx).await,
        NodeKind::SendImage(data) => messaging::send_image(data, ctx).await,
        NodeKind::AddButtons(data) => messaging::show_buttons(data, ctx).await,
        NodeKind::GetUserInput(data) => messaging::ask_input(data, ctx).await,
        NodeKind::AddCondition(data) => branching::enter_condition(data, ctx),
        NodeKind::AddDelay(data) => branching::enter_delay(data, ctx).await,
        NodeKind::CallApi(data) => api_call::call_api(data, ctx).await,
    }
}

/// Offer a resume signal to the node the execution is suspended at.
///
/// A signal that can never apply to the node (a reply delivered to a delay
/// node, say) is a routing bug in the caller and comes back as an error;
/// a signal of the right shape with a bad payload is `StillWaiting`.
pub fn resume_node(
    node: &Node,
    signal: ResumeSignal,
    execution: &mut ExecutionState,
) -> Result<ResumeOutcome, EngineError> {
    tracing::debug!(
        execution_id = %execution.id,
        node_id = %node.id,
        node_type = node.kind.type_name(),
        signal = ?signal,
        "Resuming node"
    );

    match (&node.kind, signal) {
        (NodeKind::GetUserInput(data), ResumeSignal::Reply(text)) => {
            execution.set_user_variable(&data.variable_to_save, serde_json::Value::String(text));
            Ok(ResumeOutcome::Outcome(NodeOutcome::Next(Handle::Main)))
        }
        (NodeKind::AddCondition(data), ResumeSignal::Reply(text)) => {
            Ok(ResumeOutcome::Outcome(branching::resume_condition(
                data, &text, execution,
            )))
        }
        (NodeKind::AddButtons(data), ResumeSignal::Button(index)) => {
            if index < data.buttons.len() {
                Ok(ResumeOutcome::Outcome(NodeOutcome::Next(Handle::Button(
                    index,
                ))))
            } else {
                tracing::debug!(
                    execution_id = %execution.id,
                    node_id = %node.id,
                    index,
                    "Button index out of range, staying suspended"
                );
                Ok(ResumeOutcome::StillWaiting)
            }
        }
        (NodeKind::AddDelay(_), ResumeSignal::DelayElapsed) => {
            Ok(ResumeOutcome::Outcome(NodeOutcome::Next(Handle::Main)))
        }
        (kind, signal) => Err(EngineError::Configuration(format!(
            "Node {} ({}) cannot consume signal {:?}",
            node.id,
            kind.type_name(),
            signal
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::domain::execution::{ContactId, ContactRef, ExecutionState};
    use crate::domain::flow_definition::{FlowId, NodeId};
    use crate::{ApiCallRequest, ApiCallResponse, ApiClient, EngineError, Transport};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// What a mock transport saw
    #[derive(Debug, Clone, PartialEq)]
    pub enum SentMessage {
        Text(String),
        Media { url: String, caption: Option<String> },
        Buttons { text: String, buttons: Vec<String> },
        Typing,
    }

    /// Recording transport; optionally fails every send
    #[derive(Default)]
    pub struct MockTransport {
        pub sent: Mutex<Vec<SentMessage>>,
        pub fail_sends: bool,
    }

    impl MockTransport {
        pub fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_sends: true,
            }
        }

        pub fn sent(&self) -> Vec<SentMessage> {
            self.sent.lock().unwrap().clone()
        }

        fn record(&self, message: SentMessage) -> Result<(), EngineError> {
            if self.fail_sends {
                return Err(EngineError::Transport("mock send failure".to_string()));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_text(&self, _to: &ContactId, text: &str) -> Result<(), EngineError> {
            self.record(SentMessage::Text(text.to_string()))
        }

        async fn send_media(
            &self,
            _to: &ContactId,
            url: &str,
            caption: Option<&str>,
        ) -> Result<(), EngineError> {
            self.record(SentMessage::Media {
                url: url.to_string(),
                caption: caption.map(|c| c.to_string()),
            })
        }

        async fn send_buttons(
            &self,
            _to: &ContactId,
            text: &str,
            buttons: &[String],
        ) -> Result<(), EngineError> {
            self.record(SentMessage::Buttons {
                text: text.to_string(),
                buttons: buttons.to_vec(),
            })
        }

        async fn send_typing(&self, _to: &ContactId) -> Result<(), EngineError> {
            self.record(SentMessage::Typing)
        }
    }

    /// Api client returning a canned response, recording requests
    pub struct MockApiClient {
        pub requests: Mutex<Vec<ApiCallRequest>>,
        pub response: Mutex<Option<Result<CannedResponse, EngineError>>>,
    }

    #[derive(Clone)]
    pub struct CannedResponse {
        pub status: u16,
        pub body: Value,
    }

    impl MockApiClient {
        pub fn responding(status: u16, body: Value) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                response: Mutex::new(Some(Ok(CannedResponse { status, body }))),
            }
        }

        pub fn erroring(error: EngineError) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                response: Mutex::new(Some(Err(error))),
            }
        }

        pub fn requests(&self) -> Vec<ApiCallRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ApiClient for MockApiClient {
        async fn execute(&self, request: ApiCallRequest) -> Result<ApiCallResponse, EngineError> {
            self.requests.lock().unwrap().push(request);
            let canned = self
                .response
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(Ok(CannedResponse {
                    status: 200,
                    body: Value::Null,
                }));
            canned.map(|c| ApiCallResponse {
                status: c.status,
                headers: HashMap::new(),
                body: c.body,
            })
        }
    }

    pub fn test_execution() -> ExecutionState {
        let contact = ContactRef {
            wa_id: "15551234567".to_string(),
            name: "Alice".to_string(),
        };
        ExecutionState::new(
            FlowId("test".to_string()),
            1,
            &contact,
            NodeId("start".to_string()),
        )
    }
}
