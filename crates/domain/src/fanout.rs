//! 跨实例复制事件
//!
//! 复制总线上的每条记录都是一个 [`FanoutEvent`]。`payload` 是已经序列化好的
//! 出站帧，消费端原样转发，不做二次解析；`origin_instance` 是信封上的一等字段，
//! 消费端在处理负载之前先用它判断是否为本实例发出的回环事件。

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{EnvelopeError, InstanceId, RoomId, Timestamp};

/// 复制事件类型
///
/// 目前只有 `message-posted` 会被发布；加入/离开房间只在本实例内通知。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FanoutKind {
    RoomJoined,
    RoomLeft,
    MessagePosted,
}

/// 复制总线上的事件信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutEvent {
    pub kind: FanoutKind,
    #[serde(rename = "roomID")]
    pub room_id: RoomId,
    /// 预先序列化的出站帧
    pub payload: String,
    #[serde(rename = "originInstance")]
    pub origin_instance: InstanceId,
    #[serde(rename = "emittedAt")]
    pub emitted_at: Timestamp,
}

impl FanoutEvent {
    /// 构造一条 `message-posted` 事件
    pub fn message_posted(
        origin_instance: InstanceId,
        room_id: RoomId,
        payload: impl Into<String>,
        emitted_at: Timestamp,
    ) -> Self {
        Self {
            kind: FanoutKind::MessagePosted,
            room_id,
            payload: payload.into(),
            origin_instance,
            emitted_at,
        }
    }

    /// 是否由指定实例发出
    pub fn is_from(&self, instance: &InstanceId) -> bool {
        &self.origin_instance == instance
    }

    /// 分区键（房间ID）
    pub fn partition_key(&self) -> String {
        self.room_id.partition_key()
    }

    /// 从发出到现在经过的毫秒数，仅用于日志
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.emitted_at).num_milliseconds()
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
    }
}
