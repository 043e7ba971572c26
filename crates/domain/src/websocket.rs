//! WebSocket 帧协议
//!
//! 每个文本帧是一个 JSON 对象：`{"type": ..., "payload": {...}}`。

use serde::{Deserialize, Serialize};

use crate::{MessageRecord, ProtocolError, RoomId, Timestamp, UserId};

/// 客户端到服务器的帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    /// 加入房间
    JoinRoom {
        #[serde(rename = "roomId", alias = "roomID")]
        room_id: RoomId,
    },
    /// 离开房间
    LeaveRoom {
        #[serde(rename = "roomId", alias = "roomID")]
        room_id: RoomId,
    },
    /// 发送消息
    SendMessage {
        #[serde(rename = "roomId", alias = "roomID")]
        room_id: RoomId,
        content: String,
    },
}

impl ClientFrame {
    /// 解析一个文本帧。
    ///
    /// 空白内容的 `send_message` 视为协议错误。
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame: ClientFrame = serde_json::from_str(text)?;
        if let ClientFrame::SendMessage { content, .. } = &frame {
            if content.trim().is_empty() {
                return Err(ProtocolError::EmptyContent);
            }
        }
        Ok(frame)
    }

    pub fn room_id(&self) -> RoomId {
        match self {
            ClientFrame::JoinRoom { room_id }
            | ClientFrame::LeaveRoom { room_id }
            | ClientFrame::SendMessage { room_id, .. } => *room_id,
        }
    }

    /// 帧类型名称，用于日志
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::JoinRoom { .. } => "join_room",
            ClientFrame::LeaveRoom { .. } => "leave_room",
            ClientFrame::SendMessage { .. } => "send_message",
        }
    }
}

/// 拒绝原因代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    Unauthorized,
    NotRoomMember,
    StoreError,
}

/// 服务器到客户端的帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    /// 新消息（规范化记录）
    NewMessage(MessageRecord),
    /// 用户加入房间通知，只在本实例内广播
    UserJoined {
        #[serde(rename = "userId")]
        user_id: UserId,
        username: String,
        #[serde(rename = "roomId")]
        room_id: RoomId,
        time: Timestamp,
    },
    /// 仅发给请求方的拒绝
    Error {
        code: RejectionCode,
        message: String,
        #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },
}

impl ServerFrame {
    pub fn rejection(code: RejectionCode, message: impl Into<String>, room_id: Option<RoomId>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
            room_id,
        }
    }

    /// 序列化为文本帧
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
