//! SabFlow core: a suspendable conversation flow engine.
//!
//! A flow is a validated node graph ([`domain::flow_definition::FlowDefinition`]);
//! an execution is one contact's progress through one flow
//! ([`domain::execution::ExecutionState`]). The engine is event-driven and
//! holds no state between events: each inbound message, button tap, or timer
//! expiry loads the execution from the repository, advances it as far as it
//! can go synchronously, persists it, and returns. Message delivery and HTTP
//! calls go through the [`Transport`] and [`ApiClient`] collaborator traits.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod condition;
pub mod domain;
pub mod engine;
pub mod error;
pub mod executors;
pub mod interpolate;
pub mod response_path;

pub use error::EngineError;

pub use condition::ConditionOperator;
pub use domain::execution::{
    ContactId, ContactRef, ExecutionId, ExecutionState, ExecutionStatus, RESERVED_VARIABLES,
};
pub use domain::flow_definition::{Edge, FlowDefinition, FlowId, Handle, Node, NodeId, NodeKind};
pub use domain::repository::{DelayScheduler, ExecutionRepository, FlowDefinitionRepository};
pub use engine::{ExecutionOutcome, FlowEngine, RunPolicy, TriggerEvent};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Outbound messaging collaborator (the WhatsApp sender, in production).
///
/// Delivery is best-effort from the engine's perspective: a failed send is
/// logged and the flow advances. Implementations own retries if they want
/// them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a plain text message
    async fn send_text(&self, to: &ContactId, text: &str) -> Result<(), EngineError>;

    /// Send an image by URL with an optional caption
    async fn send_media(
        &self,
        to: &ContactId,
        url: &str,
        caption: Option<&str>,
    ) -> Result<(), EngineError>;

    /// Send a message with quick-reply buttons (at most three)
    async fn send_buttons(
        &self,
        to: &ContactId,
        text: &str,
        buttons: &[String],
    ) -> Result<(), EngineError>;

    /// Show a typing indicator
    async fn send_typing(&self, to: &ContactId) -> Result<(), EngineError>;
}

/// A fully assembled, already-interpolated HTTP request for a CallApi node
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCallRequest {
    /// HTTP method
    pub method: domain::flow_definition::HttpMethod,

    /// Request URL
    pub url: String,

    /// Query parameters, in definition order
    pub query: Vec<(String, String)>,

    /// Headers, in definition order (auth headers appended last)
    pub headers: Vec<(String, String)>,

    /// Basic-auth credentials, when the node uses basic auth
    pub basic_auth: Option<(String, String)>,

    /// Request body
    pub body: Option<ApiCallBody>,
}

/// Request body shape for an API call
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCallBody {
    /// JSON document
    Json(Value),

    /// URL-encoded form fields
    Form(Vec<(String, String)>),
}

/// Response envelope from an API call
#[derive(Debug, Clone)]
pub struct ApiCallResponse {
    /// HTTP status code
    pub status: u16,

    /// Response headers
    pub headers: HashMap<String, String>,

    /// Response body, parsed as JSON when possible, a JSON string otherwise
    pub body: Value,
}

impl ApiCallResponse {
    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `{status, headers, body}` envelope stored under `responseVariable`
    pub fn to_envelope(&self) -> Value {
        serde_json::json!({
            "status": self.status,
            "headers": self.headers,
            "body": self.body,
        })
    }
}

/// HTTP client collaborator for CallApi nodes.
///
/// Implementations perform the request with bounded timeouts and return the
/// response envelope for any HTTP status; only transport-level failures
/// (connect, timeout, DNS) are errors.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Execute the request
    async fn execute(&self, request: ApiCallRequest) -> Result<ApiCallResponse, EngineError>;
}
