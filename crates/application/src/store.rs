use async_trait::async_trait;
use domain::{MessageRecord, RoomId, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("room not found")]
    RoomNotFound,
    #[error("user not found")]
    UserNotFound,
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl StoreError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

/// 持久化消息仓储
///
/// 扇出层依赖成员校验、消息创建和用户显示名查询。`create` 返回的规范化记录
/// 是唯一会被广播或发布的消息内容。
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn check_membership(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError>;

    async fn create(
        &self,
        room_id: RoomId,
        user_id: UserId,
        content: &str,
    ) -> Result<MessageRecord, StoreError>;

    /// 用户显示名，用于加入房间通知
    async fn username(&self, user_id: UserId) -> Result<String, StoreError>;
}
