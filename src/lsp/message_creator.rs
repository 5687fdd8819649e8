//! Payloads for the messages the runtime itself sends and answers:
//! handshake, cancellation, progress and dynamic registration.
use crate::lsp::config::{PeerConfig, PeerInfo};
use crate::lsp::error::ProtocolError;
use crate::lsp::types::RequestId;
use lsp_types::{
    CancelParams, ClientInfo, ProgressToken, Registration, RegistrationParams, ServerInfo, Unregistration,
    UnregistrationParams,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Method names the runtime handles itself.
pub mod methods {
    use lsp_types::notification::{self as n, Notification};
    use lsp_types::request::{self as r, Request};

    pub const INITIALIZE: &str = <r::Initialize as Request>::METHOD;
    pub const INITIALIZED: &str = <n::Initialized as Notification>::METHOD;
    pub const SHUTDOWN: &str = <r::Shutdown as Request>::METHOD;
    pub const EXIT: &str = <n::Exit as Notification>::METHOD;
    pub const CANCEL_REQUEST: &str = <n::Cancel as Notification>::METHOD;
    pub const PROGRESS: &str = <n::Progress as Notification>::METHOD;
    pub const REGISTER_CAPABILITY: &str = <r::RegisterCapability as Request>::METHOD;
    pub const UNREGISTER_CAPABILITY: &str = <r::UnregisterCapability as Request>::METHOD;
}

/// The `initialize` request params. Capabilities stay opaque so any declared
/// tree round-trips unchanged.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub process_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<ClientInfo>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub root_uri: Option<lsp_types::Url>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub capabilities: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
}

pub fn initialize_params(config: &PeerConfig) -> InitializeParams {
    InitializeParams {
        process_id: Some(std::process::id()),
        client_info: Some(ClientInfo {
            name: config.info.name.clone(),
            version: config.info.version.clone(),
        }),
        capabilities: config.capabilities.clone(),
        root_uri: config.root_uri.clone(),
    }
}

pub fn initialize_result(config: &PeerConfig) -> InitializeResult {
    InitializeResult {
        capabilities: config.capabilities.clone(),
        server_info: Some(ServerInfo {
            name: config.info.name.clone(),
            version: config.info.version.clone(),
        }),
    }
}

/// Validate what a client sent with `initialize`.
pub fn parse_initialize_params(params: Option<Value>) -> Result<InitializeParams, ProtocolError> {
    let params = params.ok_or_else(|| ProtocolError::MalformedHandshake("initialize without params".to_string()))?;
    if !params.get("capabilities").is_some_and(Value::is_object) {
        return Err(ProtocolError::MalformedHandshake(
            "initialize params lack a capabilities object".to_string(),
        ));
    }
    serde_json::from_value(params).map_err(|e| ProtocolError::MalformedHandshake(e.to_string()))
}

/// Validate the server's reply to `initialize`.
pub fn parse_initialize_result(result: Value) -> Result<InitializeResult, ProtocolError> {
    if !result.get("capabilities").is_some_and(Value::is_object) {
        return Err(ProtocolError::MalformedHandshake(
            "initialize result lacks a capabilities object".to_string(),
        ));
    }
    serde_json::from_value(result).map_err(|e| ProtocolError::MalformedHandshake(e.to_string()))
}

pub fn remote_info(client_info: Option<&ClientInfo>, server_info: Option<&ServerInfo>) -> Option<PeerInfo> {
    client_info
        .map(|info| PeerInfo {
            name: info.name.clone(),
            version: info.version.clone(),
        })
        .or_else(|| {
            server_info.map(|info| PeerInfo {
                name: info.name.clone(),
                version: info.version.clone(),
            })
        })
}

pub fn cancel_params(id: &RequestId) -> Value {
    json!({ "id": id })
}

/// The id named by an inbound `$/cancelRequest`.
pub fn parse_cancel_params(params: Option<Value>) -> Option<RequestId> {
    let params: CancelParams = serde_json::from_value(params?).ok()?;
    Some(RequestId::from(params.id))
}

pub fn progress_params(token: &ProgressToken, value: Value) -> Value {
    json!({ "token": token, "value": value })
}

/// Token and value of an inbound `$/progress`.
pub fn parse_progress_params(params: Option<&Value>) -> Option<(ProgressToken, Value)> {
    let params = params?;
    let token: ProgressToken = serde_json::from_value(params.get("token")?.clone()).ok()?;
    let value = params.get("value").cloned().unwrap_or(Value::Null);
    Some((token, value))
}

pub fn registration_params(registrations: Vec<Registration>) -> Value {
    json!(RegistrationParams { registrations })
}

pub fn unregistration_params<I, S>(ids: I, methods: impl Fn(&str) -> Option<String>) -> Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let unregisterations = ids
        .into_iter()
        .map(|id| {
            let id = id.into();
            let method = methods(&id).unwrap_or_default();
            Unregistration { id, method }
        })
        .collect();
    json!(UnregistrationParams { unregisterations })
}

pub fn parse_registration_params(params: Option<Value>) -> Result<Vec<Registration>, String> {
    let params: RegistrationParams =
        serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| e.to_string())?;
    Ok(params.registrations)
}

pub fn parse_unregistration_params(params: Option<Value>) -> Result<Vec<Unregistration>, String> {
    let params: UnregistrationParams =
        serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| e.to_string())?;
    Ok(params.unregisterations)
}
