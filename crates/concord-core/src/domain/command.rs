//! Command - レプリケーションログに載る状態遷移
//!
//! ワイヤ形式は `{type, node_id, data, timestamp}` です。
//! デコードは apply 境界で一度だけ行い、以降は型付きの [`CommandOp`] を
//! 網羅的な `match` で処理します。未知の `type` はデコードエラーになります。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{NodeId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRegistration {
    pub session_name: String,
    pub tier: String,
    pub provider: String,
    pub max_concurrent_tasks: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub session_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwnership {
    pub lock_key: String,
    pub owner_id: String,
}

/// Typed payload of a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOp {
    SessionRegister(SessionRegistration),
    SessionHeartbeat(SessionRef),
    SessionFailure(SessionRef),
    TaskAssign(TaskAssignment),
    TaskComplete(TaskRef),
    LockAcquire(LockOwnership),
    LockRelease(LockOwnership),
}

/// Wire tag of a [`CommandOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    SessionRegister,
    SessionHeartbeat,
    SessionFailure,
    TaskAssign,
    TaskComplete,
    LockAcquire,
    LockRelease,
}

impl CommandOp {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandOp::SessionRegister(_) => CommandType::SessionRegister,
            CommandOp::SessionHeartbeat(_) => CommandType::SessionHeartbeat,
            CommandOp::SessionFailure(_) => CommandType::SessionFailure,
            CommandOp::TaskAssign(_) => CommandType::TaskAssign,
            CommandOp::TaskComplete(_) => CommandType::TaskComplete,
            CommandOp::LockAcquire(_) => CommandType::LockAcquire,
            CommandOp::LockRelease(_) => CommandType::LockRelease,
        }
    }

    fn to_data(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            CommandOp::SessionRegister(data) => serde_json::to_value(data),
            CommandOp::SessionHeartbeat(data) | CommandOp::SessionFailure(data) => {
                serde_json::to_value(data)
            }
            CommandOp::TaskAssign(data) => serde_json::to_value(data),
            CommandOp::TaskComplete(data) => serde_json::to_value(data),
            CommandOp::LockAcquire(data) | CommandOp::LockRelease(data) => {
                serde_json::to_value(data)
            }
        }
    }

    fn from_data(kind: CommandType, data: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            CommandType::SessionRegister => CommandOp::SessionRegister(serde_json::from_value(data)?),
            CommandType::SessionHeartbeat => CommandOp::SessionHeartbeat(serde_json::from_value(data)?),
            CommandType::SessionFailure => CommandOp::SessionFailure(serde_json::from_value(data)?),
            CommandType::TaskAssign => CommandOp::TaskAssign(serde_json::from_value(data)?),
            CommandType::TaskComplete => CommandOp::TaskComplete(serde_json::from_value(data)?),
            CommandType::LockAcquire => CommandOp::LockAcquire(serde_json::from_value(data)?),
            CommandType::LockRelease => CommandOp::LockRelease(serde_json::from_value(data)?),
        })
    }
}

/// A state transition proposed by `node_id` at `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub node_id: NodeId,
    pub timestamp: DateTime<Utc>,
    pub op: CommandOp,
}

impl Command {
    pub fn new(node_id: NodeId, timestamp: DateTime<Utc>, op: CommandOp) -> Self {
        Self {
            node_id,
            timestamp,
            op,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct WireCommand {
    #[serde(rename = "type")]
    kind: CommandType,
    node_id: NodeId,
    data: serde_json::Value,
    timestamp: DateTime<Utc>,
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = self.op.to_data().map_err(serde::ser::Error::custom)?;
        WireCommand {
            kind: self.op.command_type(),
            node_id: self.node_id.clone(),
            data,
            timestamp: self.timestamp,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireCommand::deserialize(deserializer)?;
        let op = CommandOp::from_data(wire.kind, wire.data).map_err(serde::de::Error::custom)?;
        Ok(Command {
            node_id: wire.node_id,
            timestamp: wire.timestamp,
            op,
        })
    }
}
