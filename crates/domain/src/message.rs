//! 规范化消息记录
//!
//! 消息仓储确认持久化之后返回的记录，是唯一允许广播给其他客户端的消息形态。

use serde::{Deserialize, Serialize};

use crate::{MessageId, RoomId, Timestamp, UserId};

/// 已持久化的聊天消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// 仓储分配的消息ID
    pub id: MessageId,
    pub room_id: RoomId,
    /// 作者
    pub user_id: UserId,
    /// 作者显示名
    pub username: String,
    pub content: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}
