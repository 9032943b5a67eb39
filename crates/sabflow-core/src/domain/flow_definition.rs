use crate::EngineError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::condition::ConditionOperator;

/// Value object: Flow ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value object: Node ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A parsed, immutable conversation flow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// ID of the flow
    pub id: FlowId,

    /// Human-readable name of the flow
    pub name: String,

    /// Monotonically increasing version; executions pin the version they started on
    pub version: u32,

    /// Keywords that start this flow when a contact sends one of them
    #[serde(default)]
    pub trigger_keywords: Vec<String>,

    /// The nodes in this flow
    pub nodes: Vec<Node>,

    /// Directed edges between nodes
    pub edges: Vec<Edge>,
}

/// A node in the flow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// ID of the node, unique within the flow
    pub id: NodeId,

    /// Node type and its typed payload
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Node type with its configuration payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum NodeKind {
    /// Flow entry point
    #[serde(rename = "start")]
    Start,

    /// Send a text message
    #[serde(rename = "text")]
    SendMessage(SendMessageData),

    /// Send an image with an optional caption
    #[serde(rename = "image")]
    SendImage(SendImageData),

    /// Send a message with quick-reply buttons and wait for a tap
    #[serde(rename = "buttons")]
    AddButtons(AddButtonsData),

    /// Ask a question and wait for the contact's free-text reply
    #[serde(rename = "input")]
    GetUserInput(GetUserInputData),

    /// Two-way branch on a variable or on the next reply
    #[serde(rename = "condition")]
    AddCondition(AddConditionData),

    /// Pause before the next node
    #[serde(rename = "delay")]
    AddDelay(AddDelayData),

    /// Call an external HTTP API and map its response into variables
    #[serde(rename = "api")]
    CallApi(CallApiData),
}

impl NodeKind {
    /// Stable name used in logs and error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::SendMessage(_) => "text",
            NodeKind::SendImage(_) => "image",
            NodeKind::AddButtons(_) => "buttons",
            NodeKind::GetUserInput(_) => "input",
            NodeKind::AddCondition(_) => "condition",
            NodeKind::AddDelay(_) => "delay",
            NodeKind::CallApi(_) => "api",
        }
    }
}

/// Payload for SendMessage nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageData {
    /// Message template, interpolated before sending
    pub text: String,
}

/// Payload for SendImage nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendImageData {
    /// URL of the image, interpolated before sending
    pub image_url: String,

    /// Optional caption template
    #[serde(default)]
    pub caption: Option<String>,
}

/// Payload for AddButtons nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddButtonsData {
    /// Prompt template shown above the buttons
    pub text: String,

    /// Up to three buttons, routed by position
    pub buttons: Vec<ButtonConfig>,
}

/// A single quick-reply button
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ButtonConfig {
    /// Button label template
    pub text: String,
}

/// Payload for GetUserInput nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUserInputData {
    /// Question template sent to the contact
    pub text: String,

    /// Variable that receives the reply text
    pub variable_to_save: String,
}

/// What an AddCondition node compares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    /// Compare the current value of a stored variable
    Variable,

    /// Suspend and compare the contact's next reply
    UserResponse,
}

impl Default for ConditionType {
    fn default() -> Self {
        ConditionType::Variable
    }
}

/// Payload for AddCondition nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddConditionData {
    /// What the left-hand side is
    #[serde(default)]
    pub condition_type: ConditionType,

    /// Variable reference for `condition_type = variable`; may itself be a template
    #[serde(default)]
    pub variable: Option<String>,

    /// Comparison operator
    pub operator: ConditionOperator,

    /// Right-hand side template
    #[serde(default)]
    pub value: String,
}

/// Payload for AddDelay nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDelayData {
    /// Pause length in seconds; zero or negative means no pause
    #[serde(default)]
    pub delay_seconds: f64,

    /// Show a typing indicator while the pause runs
    #[serde(default)]
    pub show_typing: bool,
}

/// Payload for CallApi nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallApiData {
    /// The HTTP request configuration
    pub api_request: ApiRequest,
}

/// HTTP method for CallApi requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[allow(missing_docs)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Default for HttpMethod {
    fn default() -> Self {
        HttpMethod::Get
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        write!(f, "{}", s)
    }
}

/// A key/value entry in a header or query-parameter list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValuePair {
    /// Header or parameter name, interpolated before sending
    pub key: String,

    /// Header or parameter value, interpolated before sending
    pub value: String,

    /// Disabled entries are kept in the definition but not sent
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Where an API key credential is injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ApiKeyLocation {
    Header,
    Query,
}

/// Authentication for CallApi requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiAuth {
    /// No authentication
    None,

    /// `Authorization: Bearer <token>`
    #[allow(missing_docs)]
    Bearer { token: String },

    /// Arbitrary key/value credential in a header or query parameter
    #[allow(missing_docs)]
    ApiKey {
        key: String,
        value: String,
        #[serde(rename = "in")]
        location: ApiKeyLocation,
    },

    /// HTTP basic authentication
    #[allow(missing_docs)]
    Basic { username: String, password: String },
}

impl Default for ApiAuth {
    fn default() -> Self {
        ApiAuth::None
    }
}

/// Request body for CallApi requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiBody {
    /// No body
    None,

    /// URL-encoded form fields
    #[allow(missing_docs)]
    FormData {
        #[serde(rename = "formData")]
        form_data: Vec<KeyValuePair>,
    },

    /// Raw JSON text, interpolated before parsing
    #[allow(missing_docs)]
    Json { json: String },
}

impl Default for ApiBody {
    fn default() -> Self {
        ApiBody::None
    }
}

/// Maps one response-path extraction into a variable
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMapping {
    /// Variable that receives the extracted value
    pub variable: String,

    /// Dot/bracket path into the response body
    pub path: String,
}

/// Full HTTP request configuration for a CallApi node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    /// HTTP method
    #[serde(default)]
    pub method: HttpMethod,

    /// Request URL template
    pub url: String,

    /// Query parameters
    #[serde(default)]
    pub params: Vec<KeyValuePair>,

    /// Request headers
    #[serde(default)]
    pub headers: Vec<KeyValuePair>,

    /// Authentication scheme
    #[serde(default)]
    pub auth: ApiAuth,

    /// Request body
    #[serde(default)]
    pub body: ApiBody,

    /// Per-path extractions applied to the response body
    #[serde(default)]
    pub response_mappings: Vec<ResponseMapping>,

    /// Variable that receives the whole `{status, headers, body}` envelope
    #[serde(default)]
    pub response_variable: Option<String>,
}

/// Which outgoing edge a node outcome selects.
///
/// Wire form is a plain string: `main`, `yes`, `no`, or `btn-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    /// The single default continuation
    Main,

    /// Condition evaluated true
    Yes,

    /// Condition evaluated false
    No,

    /// Button at this position was tapped
    Button(usize),
}

impl Default for Handle {
    fn default() -> Self {
        Handle::Main
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Main => write!(f, "main"),
            Handle::Yes => write!(f, "yes"),
            Handle::No => write!(f, "no"),
            Handle::Button(i) => write!(f, "btn-{}", i),
        }
    }
}

impl std::str::FromStr for Handle {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Handle::Main),
            "yes" => Ok(Handle::Yes),
            "no" => Ok(Handle::No),
            other => {
                if let Some(idx) = other.strip_prefix("btn-") {
                    let i = idx.parse::<usize>().map_err(|_| {
                        EngineError::Validation(format!("Invalid button handle: {}", other))
                    })?;
                    Ok(Handle::Button(i))
                } else {
                    Err(EngineError::Validation(format!(
                        "Unknown edge handle: {}",
                        other
                    )))
                }
            }
        }
    }
}

impl Serialize for Handle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A directed edge in the flow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Source node ID
    pub source: NodeId,

    /// Which outcome of the source node this edge routes
    #[serde(default)]
    pub source_handle: Handle,

    /// Target node ID
    pub target: NodeId,
}

impl FlowDefinition {
    /// Look up a node by ID
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// The flow's single Start node
    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Start))
    }

    /// Follow the edge leaving `source` on `handle`, if one exists
    pub fn edge_target(&self, source: &NodeId, handle: &Handle) -> Option<&NodeId> {
        self.edges
            .iter()
            .find(|e| &e.source == source && &e.source_handle == handle)
            .map(|e| &e.target)
    }

    /// Whether `text` matches one of this flow's trigger keywords.
    ///
    /// Matching is against the trimmed, lowercased message.
    pub fn matches_trigger(&self, text: &str) -> bool {
        let normalized = text.trim().to_lowercase();
        self.trigger_keywords
            .iter()
            .any(|k| k.trim().to_lowercase() == normalized)
    }

    /// Validate the structure of the flow definition
    pub fn validate(&self) -> Result<(), EngineError> {
        let start_count = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start))
            .count();
        if start_count != 1 {
            return Err(EngineError::Validation(format!(
                "Flow must have exactly one start node, found {}",
                start_count
            )));
        }

        // Node ID uniqueness
        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(&node.id) {
                return Err(EngineError::Validation(format!(
                    "Duplicate node ID: {}",
                    node.id
                )));
            }
        }

        // Edge endpoints must exist
        for edge in &self.edges {
            if !node_ids.contains(&edge.source) {
                return Err(EngineError::Validation(format!(
                    "Edge references non-existent source node: {}",
                    edge.source
                )));
            }
            if !node_ids.contains(&edge.target) {
                return Err(EngineError::Validation(format!(
                    "Edge references non-existent target node: {}",
                    edge.target
                )));
            }
        }

        // Button constraints: at most 3 buttons, one outgoing edge per configured button
        for node in &self.nodes {
            if let NodeKind::AddButtons(data) = &node.kind {
                if data.buttons.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "Buttons node {} has no buttons configured",
                        node.id
                    )));
                }
                if data.buttons.len() > 3 {
                    return Err(EngineError::Validation(format!(
                        "Buttons node {} has {} buttons, maximum is 3",
                        node.id,
                        data.buttons.len()
                    )));
                }
                for idx in 0..data.buttons.len() {
                    let handle = Handle::Button(idx);
                    if self.edge_target(&node.id, &handle).is_none() {
                        return Err(EngineError::Validation(format!(
                            "Buttons node {} is missing an edge for button {}",
                            node.id, idx
                        )));
                    }
                }
            }
        }

        // Every non-start node must be reachable from the start node.
        // Cycles are legal: a branch may route back to an earlier node.
        self.check_reachability(&node_ids)?;

        Ok(())
    }

    fn check_reachability(&self, node_ids: &HashSet<&NodeId>) -> Result<(), EngineError> {
        let start = match self.start_node() {
            Some(node) => node,
            None => {
                return Err(EngineError::Validation(
                    "Flow has no start node".to_string(),
                ))
            }
        };

        let mut adjacency: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
        for edge in &self.edges {
            adjacency.entry(&edge.source).or_default().push(&edge.target);
        }

        let mut reachable = HashSet::new();
        let mut stack = vec![&start.id];
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(targets) = adjacency.get(id) {
                for target in targets {
                    stack.push(target);
                }
            }
        }

        for id in node_ids {
            if !reachable.contains(*id) {
                return Err(EngineError::Validation(format!(
                    "Node {} is not reachable from the start node",
                    id
                )));
            }
        }

        Ok(())
    }
}
