//! JSON wire protocol between participants and a room.
//!
//! Every frame is either the heartbeat literal `ping` or a JSON document
//! holding one message object or an array of them. Each message carries a
//! numeric `type`:
//!
//! ```text
//! client → server                     server → client
//! ───────────────────────────────     ─────────────────────────────────────
//! 100 UPDATE_PRESENCE                 100 UPDATE_PRESENCE   101 USER_JOINED
//! 103 BROADCAST_EVENT                 102 USER_LEFT         103 BROADCAST_EVENT
//! 200 FETCH_STORAGE                   104 ROOM_STATE
//! 201 UPDATE_STORAGE                  200 INITIAL_STORAGE_STATE (legacy)
//! 300 FETCH_YDOC                      201 UPDATE_STORAGE
//! 301 UPDATE_YDOC                     210 STORAGE_CHUNK     211 STORAGE_STREAM_END
//!                                     299 REJECT_STORAGE_OP 300 UPDATE_YDOC
//! ```
//!
//! Storage ops are carried inside UPDATE_STORAGE with their own numeric
//! `type` (see [`OpCode`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Actor ids are small integers allocated per room. `-1` is reserved as the
/// "everyone" target of a full presence broadcast.
pub type ActorId = i64;

/// JSON object payloads (presence, object fields, room metadata).
pub type JsonObject = Map<String, Value>;

/// Heartbeat request frame.
pub const PING: &str = "ping";
/// Heartbeat reply frame.
pub const PONG: &str = "pong";

/// First protocol version that receives storage as a chunked stream.
pub const STREAMING_STORAGE_VERSION: u32 = 8;

/// `target_actor` value tagging a presence message as a full replacement
/// meant for everybody.
pub const TARGET_EVERYONE: ActorId = -1;

/// Client message codes.
pub mod client_code {
    pub const UPDATE_PRESENCE: u64 = 100;
    pub const BROADCAST_EVENT: u64 = 103;
    pub const FETCH_STORAGE: u64 = 200;
    pub const UPDATE_STORAGE: u64 = 201;
    pub const FETCH_YDOC: u64 = 300;
    pub const UPDATE_YDOC: u64 = 301;
}

/// Server message codes.
pub mod server_code {
    pub const UPDATE_PRESENCE: u64 = 100;
    pub const USER_JOINED: u64 = 101;
    pub const USER_LEFT: u64 = 102;
    pub const BROADCAST_EVENT: u64 = 103;
    pub const ROOM_STATE: u64 = 104;
    pub const INITIAL_STORAGE_STATE: u64 = 200;
    pub const UPDATE_STORAGE: u64 = 201;
    pub const STORAGE_CHUNK: u64 = 210;
    pub const STORAGE_STREAM_END: u64 = 211;
    pub const REJECT_STORAGE_OP: u64 = 299;
    pub const UPDATE_YDOC: u64 = 300;
}

// ───────────────────────────────────────────────────────────────────
// CRDT node shapes
// ───────────────────────────────────────────────────────────────────

/// Node type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum CrdtType {
    Object = 0,
    List = 1,
    Map = 2,
    Register = 3,
}

impl From<CrdtType> for u8 {
    fn from(t: CrdtType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for CrdtType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CrdtType::Object),
            1 => Ok(CrdtType::List),
            2 => Ok(CrdtType::Map),
            3 => Ok(CrdtType::Register),
            other => Err(format!("unknown crdt type {other}")),
        }
    }
}

/// A node as it travels over the wire and sits in the `nodes` store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedCrdt {
    #[serde(rename = "type")]
    pub crdt_type: CrdtType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SerializedCrdt {
    /// The empty root object.
    pub fn root() -> Self {
        Self {
            crdt_type: CrdtType::Object,
            parent_id: None,
            parent_key: None,
            data: Some(Value::Object(JsonObject::new())),
        }
    }

    /// Child node under `parent_id` at `parent_key`.
    pub fn child(
        crdt_type: CrdtType,
        parent_id: impl Into<String>,
        parent_key: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            crdt_type,
            parent_id: Some(parent_id.into()),
            parent_key: Some(parent_key.into()),
            data,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Storage ops
// ───────────────────────────────────────────────────────────────────

/// Op type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    SetParentKey = 1,
    CreateList = 2,
    UpdateObject = 3,
    CreateObject = 4,
    DeleteCrdt = 5,
    DeleteObjectKey = 6,
    CreateMap = 7,
    CreateRegister = 8,
    Ack = 9,
}

impl OpCode {
    fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            1 => OpCode::SetParentKey,
            2 => OpCode::CreateList,
            3 => OpCode::UpdateObject,
            4 => OpCode::CreateObject,
            5 => OpCode::DeleteCrdt,
            6 => OpCode::DeleteObjectKey,
            7 => OpCode::CreateMap,
            8 => OpCode::CreateRegister,
            9 => OpCode::Ack,
            _ => return None,
        })
    }
}

/// Payload of the four create ops.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOp {
    pub id: String,
    pub crdt_type: CrdtType,
    pub parent_id: String,
    pub parent_key: String,
    /// Object fields for OBJECT, the value for REGISTER, `None` otherwise.
    pub data: Option<Value>,
    /// `intent: "set"`: replace whatever occupies the slot.
    pub intent_set: bool,
    /// Id the client expects to be replaced by a "set" intent.
    pub deleted_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Create(CreateOp),
    UpdateObject { id: String, data: JsonObject },
    DeleteCrdt { id: String },
    DeleteObjectKey { id: String, key: String },
    SetParentKey { id: String, parent_key: String },
    /// Acknowledges an op the server ignored.
    Ack,
}

/// A storage mutation. `op_id` is private to the submitting session and is
/// stripped before the op is shown to anyone else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireOp", into = "WireOp")]
pub struct Op {
    pub op_id: Option<String>,
    pub kind: OpKind,
}

impl Op {
    pub fn new(op_id: Option<String>, kind: OpKind) -> Self {
        Self { op_id, kind }
    }

    pub fn ack(op_id: impl Into<String>) -> Self {
        Self {
            op_id: Some(op_id.into()),
            kind: OpKind::Ack,
        }
    }

    /// Node the op acts on (the created node for create ops).
    pub fn target_id(&self) -> Option<&str> {
        match &self.kind {
            OpKind::Create(c) => Some(&c.id),
            OpKind::UpdateObject { id, .. }
            | OpKind::DeleteCrdt { id }
            | OpKind::DeleteObjectKey { id, .. }
            | OpKind::SetParentKey { id, .. } => Some(id),
            OpKind::Ack => None,
        }
    }

    pub fn without_op_id(&self) -> Op {
        Op {
            op_id: None,
            kind: self.kind.clone(),
        }
    }

    pub fn code(&self) -> OpCode {
        match &self.kind {
            OpKind::Create(c) => match c.crdt_type {
                CrdtType::Object => OpCode::CreateObject,
                CrdtType::List => OpCode::CreateList,
                CrdtType::Map => OpCode::CreateMap,
                CrdtType::Register => OpCode::CreateRegister,
            },
            OpKind::UpdateObject { .. } => OpCode::UpdateObject,
            OpKind::DeleteCrdt { .. } => OpCode::DeleteCrdt,
            OpKind::DeleteObjectKey { .. } => OpCode::DeleteObjectKey,
            OpKind::SetParentKey { .. } => OpCode::SetParentKey,
            OpKind::Ack => OpCode::Ack,
        }
    }
}

/// Flat JSON form of an [`Op`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOp {
    #[serde(rename = "type")]
    op_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    op_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deleted_id: Option<String>,
}

fn required(field: Option<String>, name: &str, code: u8) -> Result<String, String> {
    field.ok_or_else(|| format!("op type {code} is missing `{name}`"))
}

impl TryFrom<WireOp> for Op {
    type Error = String;

    fn try_from(w: WireOp) -> Result<Self, Self::Error> {
        let code = OpCode::from_u8(w.op_type).ok_or_else(|| format!("unknown op type {}", w.op_type))?;
        let t = w.op_type;
        let kind = match code {
            OpCode::CreateObject | OpCode::CreateList | OpCode::CreateMap | OpCode::CreateRegister => {
                let crdt_type = match code {
                    OpCode::CreateObject => CrdtType::Object,
                    OpCode::CreateList => CrdtType::List,
                    OpCode::CreateMap => CrdtType::Map,
                    _ => CrdtType::Register,
                };
                let data = match crdt_type {
                    CrdtType::Object => match w.data {
                        None => Some(Value::Object(JsonObject::new())),
                        Some(Value::Object(map)) => Some(Value::Object(map)),
                        Some(_) => return Err("object data must be a JSON object".into()),
                    },
                    CrdtType::Register => Some(w.data.unwrap_or(Value::Null)),
                    CrdtType::List | CrdtType::Map => None,
                };
                OpKind::Create(CreateOp {
                    id: required(w.id, "id", t)?,
                    crdt_type,
                    parent_id: required(w.parent_id, "parentId", t)?,
                    parent_key: required(w.parent_key, "parentKey", t)?,
                    data,
                    intent_set: w.intent.as_deref() == Some("set"),
                    deleted_id: w.deleted_id,
                })
            }
            OpCode::UpdateObject => {
                let data = match w.data {
                    Some(Value::Object(map)) => map,
                    _ => return Err("UPDATE_OBJECT requires object `data`".into()),
                };
                OpKind::UpdateObject {
                    id: required(w.id, "id", t)?,
                    data,
                }
            }
            OpCode::DeleteCrdt => OpKind::DeleteCrdt {
                id: required(w.id, "id", t)?,
            },
            OpCode::DeleteObjectKey => OpKind::DeleteObjectKey {
                id: required(w.id, "id", t)?,
                key: required(w.key, "key", t)?,
            },
            OpCode::SetParentKey => OpKind::SetParentKey {
                id: required(w.id, "id", t)?,
                parent_key: required(w.parent_key, "parentKey", t)?,
            },
            OpCode::Ack => OpKind::Ack,
        };
        Ok(Op {
            op_id: w.op_id,
            kind,
        })
    }
}

impl From<Op> for WireOp {
    fn from(op: Op) -> Self {
        let op_type = op.code() as u8;
        let mut w = WireOp {
            op_type,
            op_id: op.op_id,
            ..WireOp::default()
        };
        match op.kind {
            OpKind::Create(c) => {
                w.id = Some(c.id);
                w.parent_id = Some(c.parent_id);
                w.parent_key = Some(c.parent_key);
                w.data = c.data;
                w.intent = c.intent_set.then(|| "set".to_string());
                w.deleted_id = c.deleted_id;
            }
            OpKind::UpdateObject { id, data } => {
                w.id = Some(id);
                w.data = Some(Value::Object(data));
            }
            OpKind::DeleteCrdt { id } => w.id = Some(id),
            OpKind::DeleteObjectKey { id, key } => {
                w.id = Some(id);
                w.key = Some(key);
            }
            OpKind::SetParentKey { id, parent_key } => {
                w.id = Some(id);
                w.parent_key = Some(parent_key);
            }
            OpKind::Ack => {}
        }
        w
    }
}

// ───────────────────────────────────────────────────────────────────
// Client messages
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    UpdatePresence {
        data: JsonObject,
        target_actor: Option<ActorId>,
    },
    BroadcastEvent {
        event: Value,
    },
    FetchStorage,
    UpdateStorage {
        ops: Vec<Op>,
    },
    /// Base64 state vector of the client's copy of the binary document.
    FetchYdoc {
        vector: String,
    },
    /// Base64 binary document update.
    UpdateYdoc {
        update: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresencePayload {
    data: JsonObject,
    #[serde(default)]
    target_actor: Option<ActorId>,
}

#[derive(Deserialize)]
struct EventPayload {
    event: Value,
}

#[derive(Deserialize)]
struct OpsPayload {
    ops: Vec<Op>,
}

#[derive(Deserialize)]
struct VectorPayload {
    #[serde(default)]
    vector: String,
}

#[derive(Deserialize)]
struct UpdatePayload {
    update: String,
}

impl ClientMsg {
    /// Decode one message object.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        let code = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::MissingType)?;
        let msg = match code {
            client_code::UPDATE_PRESENCE => {
                let p: PresencePayload = serde_json::from_value(value)?;
                ClientMsg::UpdatePresence {
                    data: p.data,
                    target_actor: p.target_actor,
                }
            }
            client_code::BROADCAST_EVENT => {
                let p: EventPayload = serde_json::from_value(value)?;
                ClientMsg::BroadcastEvent { event: p.event }
            }
            client_code::FETCH_STORAGE => ClientMsg::FetchStorage,
            client_code::UPDATE_STORAGE => {
                let p: OpsPayload = serde_json::from_value(value)?;
                ClientMsg::UpdateStorage { ops: p.ops }
            }
            client_code::FETCH_YDOC => {
                let p: VectorPayload = serde_json::from_value(value)?;
                ClientMsg::FetchYdoc { vector: p.vector }
            }
            client_code::UPDATE_YDOC => {
                let p: UpdatePayload = serde_json::from_value(value)?;
                ClientMsg::UpdateYdoc { update: p.update }
            }
            other => return Err(ProtocolError::UnknownType(other)),
        };
        Ok(msg)
    }

    /// Encode to a JSON value (used by clients and tests).
    pub fn to_value(&self) -> Value {
        match self {
            ClientMsg::UpdatePresence { data, target_actor } => {
                let mut v = json!({ "type": client_code::UPDATE_PRESENCE, "data": data });
                if let Some(target) = target_actor {
                    v["targetActor"] = json!(target);
                }
                v
            }
            ClientMsg::BroadcastEvent { event } => {
                json!({ "type": client_code::BROADCAST_EVENT, "event": event })
            }
            ClientMsg::FetchStorage => json!({ "type": client_code::FETCH_STORAGE }),
            ClientMsg::UpdateStorage { ops } => {
                json!({ "type": client_code::UPDATE_STORAGE, "ops": ops })
            }
            ClientMsg::FetchYdoc { vector } => {
                json!({ "type": client_code::FETCH_YDOC, "vector": vector })
            }
            ClientMsg::UpdateYdoc { update } => {
                json!({ "type": client_code::UPDATE_YDOC, "update": update })
            }
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ping,
    Messages(Vec<ClientMsg>),
}

/// Decode a raw text frame. A single object is treated as a batch of one.
pub fn decode_frame(raw: &str) -> Result<Frame, ProtocolError> {
    if raw == PING {
        return Ok(Frame::Ping);
    }
    let value: Value = serde_json::from_str(raw)?;
    let msgs = match value {
        Value::Array(items) => items
            .into_iter()
            .map(ClientMsg::from_value)
            .collect::<Result<Vec<_>, _>>()?,
        obj @ Value::Object(_) => vec![ClientMsg::from_value(obj)?],
        _ => return Err(ProtocolError::NotAnObject),
    };
    Ok(Frame::Messages(msgs))
}

// ───────────────────────────────────────────────────────────────────
// Server messages
// ───────────────────────────────────────────────────────────────────

/// Roster entry in ROOM_STATE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub info: Value,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMsg {
    /// `target_actor`: `None` for a partial patch, `Some(-1)` for a full
    /// presence meant for all, `Some(actor)` for a full presence sent to one.
    UpdatePresence {
        actor: ActorId,
        data: JsonObject,
        target_actor: Option<ActorId>,
    },
    UserJoined {
        actor: ActorId,
        id: Option<String>,
        info: Value,
        scopes: Vec<String>,
    },
    UserLeft {
        actor: ActorId,
    },
    BroadcastEvent {
        actor: ActorId,
        event: Value,
    },
    RoomState {
        actor: ActorId,
        nonce: String,
        scopes: Vec<String>,
        users: BTreeMap<ActorId, UserEntry>,
        meta: JsonObject,
    },
    InitialStorageState {
        items: Vec<(String, SerializedCrdt)>,
    },
    UpdateStorage {
        ops: Vec<Op>,
    },
    StorageChunk {
        nodes: Vec<(String, SerializedCrdt)>,
    },
    StorageStreamEnd,
    RejectStorageOp {
        op_ids: Vec<String>,
        reason: String,
    },
    UpdateYdoc {
        update: String,
        is_sync: bool,
        state_vector: Option<String>,
    },
}

impl ServerMsg {
    pub fn code(&self) -> u64 {
        match self {
            ServerMsg::UpdatePresence { .. } => server_code::UPDATE_PRESENCE,
            ServerMsg::UserJoined { .. } => server_code::USER_JOINED,
            ServerMsg::UserLeft { .. } => server_code::USER_LEFT,
            ServerMsg::BroadcastEvent { .. } => server_code::BROADCAST_EVENT,
            ServerMsg::RoomState { .. } => server_code::ROOM_STATE,
            ServerMsg::InitialStorageState { .. } => server_code::INITIAL_STORAGE_STATE,
            ServerMsg::UpdateStorage { .. } => server_code::UPDATE_STORAGE,
            ServerMsg::StorageChunk { .. } => server_code::STORAGE_CHUNK,
            ServerMsg::StorageStreamEnd => server_code::STORAGE_STREAM_END,
            ServerMsg::RejectStorageOp { .. } => server_code::REJECT_STORAGE_OP,
            ServerMsg::UpdateYdoc { .. } => server_code::UPDATE_YDOC,
        }
    }

    pub fn to_value(&self) -> Value {
        let code = self.code();
        match self {
            ServerMsg::UpdatePresence {
                actor,
                data,
                target_actor,
            } => {
                let mut v = json!({ "type": code, "actor": actor, "data": data });
                if let Some(target) = target_actor {
                    v["targetActor"] = json!(target);
                }
                v
            }
            ServerMsg::UserJoined {
                actor,
                id,
                info,
                scopes,
            } => json!({ "type": code, "actor": actor, "id": id, "info": info, "scopes": scopes }),
            ServerMsg::UserLeft { actor } => json!({ "type": code, "actor": actor }),
            ServerMsg::BroadcastEvent { actor, event } => {
                json!({ "type": code, "actor": actor, "event": event })
            }
            ServerMsg::RoomState {
                actor,
                nonce,
                scopes,
                users,
                meta,
            } => {
                // JSON object keys must be strings
                let users: Map<String, Value> = users
                    .iter()
                    .map(|(actor, entry)| (actor.to_string(), json!(entry)))
                    .collect();
                json!({
                    "type": code,
                    "actor": actor,
                    "nonce": nonce,
                    "scopes": scopes,
                    "users": users,
                    "meta": meta,
                })
            }
            ServerMsg::InitialStorageState { items } => json!({ "type": code, "items": items }),
            ServerMsg::UpdateStorage { ops } => json!({ "type": code, "ops": ops }),
            ServerMsg::StorageChunk { nodes } => json!({ "type": code, "nodes": nodes }),
            ServerMsg::StorageStreamEnd => json!({ "type": code }),
            ServerMsg::RejectStorageOp { op_ids, reason } => {
                json!({ "type": code, "opIds": op_ids, "reason": reason })
            }
            ServerMsg::UpdateYdoc {
                update,
                is_sync,
                state_vector,
            } => {
                let mut v = json!({ "type": code, "update": update, "isSync": is_sync });
                if let Some(sv) = state_vector {
                    v["stateVector"] = json!(sv);
                }
                v
            }
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Message is not a JSON object")]
    NotAnObject,
    #[error("Message has no numeric type")]
    MissingType,
    #[error("Unknown message type {0}")]
    UnknownType(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ping() {
        assert_eq!(decode_frame("ping").unwrap(), Frame::Ping);
    }

    #[test]
    fn test_decode_single_object_is_batch_of_one() {
        let frame = decode_frame(r#"{"type":200}"#).unwrap();
        assert_eq!(frame, Frame::Messages(vec![ClientMsg::FetchStorage]));
    }

    #[test]
    fn test_decode_batch() {
        let raw = r#"[
            {"type":100,"data":{"x":1}},
            {"type":103,"event":{"emoji":"🔥"}},
            {"type":201,"ops":[{"type":3,"opId":"1:0","id":"root","data":{"a":1}}]}
        ]"#;
        let Frame::Messages(msgs) = decode_frame(raw).unwrap() else {
            panic!("expected messages");
        };
        assert_eq!(msgs.len(), 3);
        match &msgs[2] {
            ClientMsg::UpdateStorage { ops } => {
                assert_eq!(ops[0].op_id.as_deref(), Some("1:0"));
                assert_eq!(ops[0].target_id(), Some("root"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_frame("{not json").is_err());
        assert!(decode_frame("42").is_err());
        assert!(decode_frame(r#"{"data":1}"#).is_err());
        assert!(matches!(
            decode_frame(r#"{"type":999}"#),
            Err(ProtocolError::UnknownType(999))
        ));
        // One bad message poisons the whole batch
        assert!(decode_frame(r#"[{"type":200},{"type":201,"ops":[{"type":4}]}]"#).is_err());
    }

    #[test]
    fn test_create_op_wire_form() {
        let raw = r#"{"type":4,"opId":"7:1","id":"7:2","parentId":"root","parentKey":"shape","data":{"x":1},"intent":"set"}"#;
        let op: Op = serde_json::from_str(raw).unwrap();
        match &op.kind {
            OpKind::Create(c) => {
                assert_eq!(c.crdt_type, CrdtType::Object);
                assert!(c.intent_set);
                assert_eq!(c.parent_key, "shape");
            }
            other => panic!("unexpected {other:?}"),
        }
        let stripped = serde_json::to_value(op.without_op_id()).unwrap();
        assert!(stripped.get("opId").is_none());
        assert_eq!(stripped["type"], 4);
        assert_eq!(stripped["intent"], "set");
    }

    #[test]
    fn test_register_op_defaults_to_null() {
        let op: Op =
            serde_json::from_str(r#"{"type":8,"id":"1:0","parentId":"l","parentKey":"!"}"#).unwrap();
        match op.kind {
            OpKind::Create(c) => assert_eq!(c.data, Some(Value::Null)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_object_op_rejects_scalar_data() {
        let res: Result<Op, _> =
            serde_json::from_str(r#"{"type":4,"id":"1:0","parentId":"root","parentKey":"k","data":5}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_room_state_users_keyed_by_string() {
        let mut users = BTreeMap::new();
        users.insert(
            3,
            UserEntry {
                id: Some("u3".into()),
                info: json!({"name": "Ada"}),
                scopes: vec!["room:write".into()],
            },
        );
        let msg = ServerMsg::RoomState {
            actor: 4,
            nonce: "n".into(),
            scopes: vec![],
            users,
            meta: JsonObject::new(),
        };
        let v = msg.to_value();
        assert_eq!(v["type"], 104);
        assert_eq!(v["users"]["3"]["info"]["name"], "Ada");
    }

    #[test]
    fn test_presence_target_actor_encoding() {
        let partial = ServerMsg::UpdatePresence {
            actor: 1,
            data: JsonObject::new(),
            target_actor: None,
        };
        assert!(partial.to_value().get("targetActor").is_none());

        let full = ServerMsg::UpdatePresence {
            actor: 1,
            data: JsonObject::new(),
            target_actor: Some(TARGET_EVERYONE),
        };
        assert_eq!(full.to_value()["targetActor"], -1);
    }

    #[test]
    fn test_serialized_crdt_shape() {
        let crdt = SerializedCrdt::child(CrdtType::Register, "l", "!", Some(json!("hi")));
        let v = serde_json::to_value(&crdt).unwrap();
        assert_eq!(v, json!({"type": 3, "parentId": "l", "parentKey": "!", "data": "hi"}));
        let back: SerializedCrdt = serde_json::from_value(v).unwrap();
        assert_eq!(back, crdt);
        assert!(serde_json::from_value::<SerializedCrdt>(json!({"type": 9})).is_err());
    }

    #[test]
    fn test_client_msg_value_roundtrip() {
        let msg = ClientMsg::UpdatePresence {
            data: json!({"cursor": {"x": 1}}).as_object().cloned().unwrap(),
            target_actor: Some(2),
        };
        assert_eq!(ClientMsg::from_value(msg.to_value()).unwrap(), msg);
    }
}
