//! Gateway wire protocol: JSON envelopes over a persistent socket, one
//! envelope per frame. Three envelope kinds flow in both directions:
//! `req` (carries an id + method), `res` (matches a req by id, gated by
//! `ok`), and `event` (unsolicited, matched to turns by run id).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::RunId;

/// Protocol version spoken by this client. Offered as both the minimum
/// and maximum during the handshake.
pub const PROTOCOL_VERSION: u32 = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Req {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Res {
        id: String,
        #[serde(default)]
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

impl Envelope {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self::Req {
            id: id.into(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// Identity block sent in the handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthParams {
    pub token: String,
}

/// Params for the versioned `connect` handshake request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub auth: AuthParams,
}

/// Params for `chat.send`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatSendParams {
    pub message: String,
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
}

/// Run lifecycle phases announced on the `agent` event stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecyclePhase {
    Start,
    End,
}

/// Parse an `agent` event payload into a lifecycle phase, if that is what
/// it carries. Other agent streams are ignored.
pub fn lifecycle_event(payload: &Value) -> Option<(RunId, LifecyclePhase)> {
    if payload.get("stream").and_then(Value::as_str) != Some("lifecycle") {
        return None;
    }
    let run_id = payload.get("runId").and_then(Value::as_str)?;
    let phase = match payload.pointer("/data/phase").and_then(Value::as_str)? {
        "start" => LifecyclePhase::Start,
        "end" => LifecyclePhase::End,
        _ => return None,
    };
    Some((RunId::from_raw(run_id), phase))
}

/// Parse a `chat` event payload into a terminal assistant reply. Returns
/// `None` for non-final states, non-assistant messages, missing run ids,
/// and empty text; all of those leave the turn to other resolution paths.
pub fn final_reply(payload: &Value) -> Option<(RunId, String)> {
    if payload.get("state").and_then(Value::as_str) != Some("final") {
        return None;
    }
    let message = payload.get("message")?;
    if message.get("role").and_then(Value::as_str) != Some("assistant") {
        return None;
    }
    let run_id = payload.get("runId").and_then(Value::as_str)?;
    let text = assistant_text(message.get("content")?);
    if text.is_empty() {
        return None;
    }
    Some((RunId::from_raw(run_id), text))
}

/// Assistant content is either a plain string or an array of typed blocks;
/// text blocks are concatenated in order, everything else is skipped.
pub fn assistant_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}
