//! Engine.IO v4 / Socket.IO v4 text framing over a plain websocket.
//!
//! Only the default namespace and text packets are supported; binary attachments are
//! never produced by the KOL feed server.

use crate::error::AppError;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;

const SOCKET_IO_SEGMENT: &str = "socket.io/";
const ENGINE_IO_QUERY: &str = "EIO=4&transport=websocket";

/// One named event travelling over the socket in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketEvent {
    pub name: String,
    pub data: Value,
}

impl SocketEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn bare(name: impl Into<String>) -> Self {
        Self::new(name, Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Value),
    Disconnect,
    Event(SocketEvent),
    ConnectError(Value),
    Unsupported(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Noop,
}

/// Where the socket lives, derived from the REST base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEndpoint {
    pub origin: String,
    pub path: String,
}

impl SocketEndpoint {
    pub fn url(&self) -> String {
        format!("{}{}?{ENGINE_IO_QUERY}", self.origin, self.path)
    }
}

/// Splits `https://host:port/prefix` into the websocket origin and the
/// `/prefix/socket.io/` path. An explicit websocket URL overrides the origin only.
pub fn derive_socket_endpoint(
    api_url: &str,
    ws_override: Option<&str>,
) -> Result<SocketEndpoint, AppError> {
    let api = Url::parse(api_url)
        .map_err(|error| AppError::InvalidArgument(format!("invalid api url: {error}")))?;
    let prefix = api.path().trim_end_matches('/');
    let path = format!("{prefix}/{SOCKET_IO_SEGMENT}");

    let origin_source = match ws_override {
        Some(value) => Url::parse(value)
            .map_err(|error| AppError::InvalidArgument(format!("invalid ws url: {error}")))?,
        None => api,
    };
    let scheme = match origin_source.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(AppError::InvalidArgument(format!(
                "unsupported socket scheme '{other}'"
            )))
        }
    };
    let host = origin_source
        .host_str()
        .ok_or_else(|| AppError::InvalidArgument("socket url has no host".to_string()))?;
    let origin = match origin_source.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    };

    Ok(SocketEndpoint { origin, path })
}

pub fn decode_frame(frame: &str) -> Result<EnginePacket, AppError> {
    let mut chars = frame.chars();
    let kind = chars
        .next()
        .ok_or_else(|| AppError::InvalidPayload("empty engine frame".to_string()))?;
    let rest = chars.as_str();

    match kind {
        '0' => {
            let mut owned = rest.as_bytes().to_vec();
            let handshake: OpenHandshake = simd_json::serde::from_slice(&mut owned)?;
            Ok(EnginePacket::Open(handshake))
        }
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping),
        '3' => Ok(EnginePacket::Pong),
        '4' => decode_socket_packet(rest).map(EnginePacket::Message),
        '6' => Ok(EnginePacket::Noop),
        other => Err(AppError::InvalidPayload(format!(
            "unsupported engine packet type '{other}'"
        ))),
    }
}

fn decode_socket_packet(body: &str) -> Result<SocketPacket, AppError> {
    let mut chars = body.chars();
    let kind = chars
        .next()
        .and_then(|ch| ch.to_digit(10))
        .ok_or_else(|| AppError::InvalidPayload("missing socket packet type".to_string()))?;
    // Default namespace only; an ack id may precede the JSON body.
    let payload = chars.as_str().trim_start_matches(|ch: char| ch.is_ascii_digit());

    match kind {
        0 => Ok(SocketPacket::Connect(parse_optional_json(payload)?)),
        1 => Ok(SocketPacket::Disconnect),
        2 => decode_event(payload).map(SocketPacket::Event),
        4 => Ok(SocketPacket::ConnectError(parse_optional_json(payload)?)),
        other => Ok(SocketPacket::Unsupported(other as u8)),
    }
}

fn parse_optional_json(payload: &str) -> Result<Value, AppError> {
    if payload.is_empty() {
        return Ok(Value::Null);
    }
    let mut owned = payload.as_bytes().to_vec();
    Ok(simd_json::serde::from_slice(&mut owned)?)
}

fn decode_event(payload: &str) -> Result<SocketEvent, AppError> {
    let value = parse_optional_json(payload)?;
    let Value::Array(mut items) = value else {
        return Err(AppError::InvalidPayload(
            "socket event body must be an array".to_string(),
        ));
    };
    if items.is_empty() {
        return Err(AppError::InvalidPayload(
            "socket event body is empty".to_string(),
        ));
    }
    let name = match items.remove(0) {
        Value::String(name) => name,
        _ => {
            return Err(AppError::InvalidPayload(
                "socket event name must be a string".to_string(),
            ))
        }
    };
    let data = if items.is_empty() {
        Value::Null
    } else {
        items.swap_remove(0)
    };
    Ok(SocketEvent { name, data })
}

pub fn encode_connect(auth_token: Option<&str>) -> Result<String, AppError> {
    match auth_token {
        Some(token) => {
            let auth = serde_json::json!({ "token": token });
            Ok(format!("40{}", serde_json::to_string(&auth)?))
        }
        None => Ok("40".to_string()),
    }
}

pub fn encode_disconnect() -> &'static str {
    "41"
}

pub fn encode_event(event: &SocketEvent) -> Result<String, AppError> {
    let body = if event.data.is_null() {
        serde_json::to_string(&[Value::String(event.name.clone())])?
    } else {
        serde_json::to_string(&(&event.name, &event.data))?
    };
    Ok(format!("42{body}"))
}

pub fn encode_pong() -> &'static str {
    "3"
}
