//! Wire types for the per-session command channel.
//!
//! Every running snap owns one duplex transport. It is multiplexed into named
//! sub-channels (see [`MuxFrame`]); the `command` sub-channel carries the
//! JSON-RPC shaped messages defined here.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Sub-channel names used on a session transport.
pub mod channels {
    pub const COMMAND: &str = "command";
    pub const RPC: &str = "jsonRpc";
}

/// Methods the controller sends to a session.
pub mod methods {
    pub const PING: &str = "ping";
    pub const EXECUTE_SNAP: &str = "executeSnap";
    pub const TERMINATE: &str = "terminate";
    pub const SNAP_RPC: &str = "snapRpc";
}

/// Notifications a session may emit without being asked.
pub mod notifications {
    pub const OUTBOUND_REQUEST: &str = "OutboundRequest";
    pub const OUTBOUND_RESPONSE: &str = "OutboundResponse";
    pub const UNHANDLED_ERROR: &str = "UnhandledError";
}

/// Standard JSON-RPC error codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Correlation id. Sessions may answer with numeric or string ids.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash, JsonSchema)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    String(String),
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Number(n) => write!(f, "{n}"),
            RpcId::String(s) => f.write_str(s),
        }
    }
}

impl From<String> for RpcId {
    fn from(value: String) -> Self {
        RpcId::String(value)
    }
}

impl From<&str> for RpcId {
    fn from(value: &str) -> Self {
        RpcId::String(value.to_string())
    }
}

impl From<i64> for RpcId {
    fn from(value: i64) -> Self {
        RpcId::Number(value)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: RpcId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<RpcId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("The method \"{method}\" does not exist / is not available."),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcErrorObject {}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn success(id: RpcId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RpcId, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// An `error` member wins over `result`; a response with neither resolves to `null`.
    pub fn into_result(self) -> Result<Value, RpcErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A decoded message read off a sub-channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
    Notification(RpcNotification),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MalformedMessage {
    pub reason: String,
    pub raw: Value,
}

impl fmt::Display for MalformedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed message: {}", self.reason)
    }
}

impl std::error::Error for MalformedMessage {}

impl RpcMessage {
    /// Classify a raw frame by shape: `method` + `id` is a request, `method`
    /// alone is a notification, `id` with `result` or `error` is a response.
    pub fn classify(raw: Value) -> Result<Self, MalformedMessage> {
        let Some(obj) = raw.as_object() else {
            return Err(MalformedMessage {
                reason: "not an object".into(),
                raw,
            });
        };
        let has_method = obj.contains_key("method");
        let has_id = obj.get("id").map(|v| !v.is_null()).unwrap_or(false);
        let has_outcome = obj.contains_key("result") || obj.contains_key("error");

        let decoded = match (has_method, has_id, has_outcome) {
            (true, true, _) => serde_json::from_value(raw.clone()).map(RpcMessage::Request),
            (true, false, _) => serde_json::from_value(raw.clone()).map(RpcMessage::Notification),
            (false, true, true) => serde_json::from_value(raw.clone()).map(RpcMessage::Response),
            _ => {
                return Err(MalformedMessage {
                    reason: "neither request, response nor notification".into(),
                    raw,
                })
            }
        };
        decoded.map_err(|err| MalformedMessage {
            reason: err.to_string(),
            raw,
        })
    }

    pub fn into_value(self) -> Value {
        let encoded = match self {
            RpcMessage::Request(req) => serde_json::to_value(req),
            RpcMessage::Response(resp) => serde_json::to_value(resp),
            RpcMessage::Notification(note) => serde_json::to_value(note),
        };
        encoded.unwrap_or(Value::Null)
    }
}

/// Entry points a snap may export. Each one is gated by a distinct endowment permission.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum HandlerType {
    OnRpcRequest,
    OnTransaction,
    OnCronjob,
    OnNameLookup,
    OnInstall,
    OnUpdate,
    OnHomePage,
    OnSignature,
}

impl HandlerType {
    pub const ALL: [HandlerType; 8] = [
        HandlerType::OnRpcRequest,
        HandlerType::OnTransaction,
        HandlerType::OnCronjob,
        HandlerType::OnNameLookup,
        HandlerType::OnInstall,
        HandlerType::OnUpdate,
        HandlerType::OnHomePage,
        HandlerType::OnSignature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerType::OnRpcRequest => "onRpcRequest",
            HandlerType::OnTransaction => "onTransaction",
            HandlerType::OnCronjob => "onCronjob",
            HandlerType::OnNameLookup => "onNameLookup",
            HandlerType::OnInstall => "onInstall",
            HandlerType::OnUpdate => "onUpdate",
            HandlerType::OnHomePage => "onHomePage",
            HandlerType::OnSignature => "onSignature",
        }
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Params of the `executeSnap` command.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteSnapParams {
    pub snap_id: String,
    pub source_code: String,
    #[serde(default)]
    pub endowments: Vec<String>,
}

/// Params of the `snapRpc` command.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapRpcParams {
    pub target: String,
    pub origin: String,
    pub handler: HandlerType,
    pub request: Value,
}

/// Params of the `UnhandledError` notification.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct UnhandledErrorParams {
    pub error: RpcErrorObject,
}

/// One frame on the raw session transport.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct MuxFrame {
    pub name: String,
    pub data: Value,
}

impl MuxFrame {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// JSON schema for the command-channel payload types, for hosts implementing sessions
/// in another runtime.
pub fn protocol_schema_json() -> Value {
    let schemas = serde_json::json!({
        "request": schemars::schema_for!(RpcRequest),
        "response": schemars::schema_for!(RpcResponse),
        "notification": schemars::schema_for!(RpcNotification),
        "executeSnap": schemars::schema_for!(ExecuteSnapParams),
        "snapRpc": schemars::schema_for!(SnapRpcParams),
        "frame": schemars::schema_for!(MuxFrame),
    });
    schemas
}
