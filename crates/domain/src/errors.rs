//! 领域模型错误定义
//!
//! 协议帧解析与复制事件编解码的错误类型。

use thiserror::Error;

/// 客户端帧协议错误
///
/// 畸形帧只记录日志并丢弃，不会关闭连接。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// JSON 解析失败、未知类型或缺失字段
    #[error("帧格式错误: {message}")]
    Malformed { message: String },

    /// 不支持的帧（例如二进制帧）
    #[error("不支持的帧类型: {kind}")]
    Unsupported { kind: String },

    /// 消息内容为空
    #[error("消息内容不能为空")]
    EmptyContent,
}

impl ProtocolError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub fn unsupported(kind: impl Into<String>) -> Self {
        Self::Unsupported { kind: kind.into() }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::malformed(err.to_string())
    }
}

/// 复制事件编解码错误
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("序列化复制事件失败: {0}")]
    Encode(serde_json::Error),
    #[error("反序列化复制事件失败: {0}")]
    Decode(serde_json::Error),
}
