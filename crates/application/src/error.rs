use thiserror::Error;

/// 复制总线错误
///
/// 发布失败会报告给调用方，但不会回滚已经完成的本地广播；
/// 消费失败由消费循环退避重试。
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus publish failed: {0}")]
    Publish(String),
    #[error("bus consume failed: {0}")]
    Consume(String),
    #[error("bus receiver lagged, skipped {0} events")]
    Lagged(u64),
    #[error("bus transport closed")]
    Closed,
    #[error("bus envelope error: {0}")]
    Envelope(#[from] domain::EnvelopeError),
}

impl BusError {
    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish(message.into())
    }

    pub fn consume(message: impl Into<String>) -> Self {
        Self::Consume(message.into())
    }
}

/// 向单个连接投递出站帧失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    QueueFull,
    #[error("outbound queue still full after the delivery timeout")]
    Timeout,
    #[error("connection is closed")]
    Closed,
}

/// 连接读写失败，只记录日志并触发注销
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection read failed: {0}")]
    Read(String),
    #[error("connection write failed: {0}")]
    Write(String),
}
