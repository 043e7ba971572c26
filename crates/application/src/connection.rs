//! 单个客户端连接
//!
//! 每个连接持有一个有界出站队列，由传输层的专用写任务消费。广播方只做
//! 非阻塞入队，或在队列已满时做有上限的等待，从不直接写 socket。

use std::sync::Arc;
use std::time::Duration;

use domain::{ConnectionId, UserId};
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};
use tokio_util::sync::CancellationToken;

use crate::error::DeliveryError;

/// 写往客户端的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// 文本帧；同一条广播在所有连接间共享同一份缓冲
    Text(Arc<str>),
}

impl OutboundFrame {
    pub fn text(text: impl Into<Arc<str>>) -> Self {
        OutboundFrame::Text(text.into())
    }
}

/// 从客户端读到的帧，已与具体的 WebSocket 实现解耦
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close,
}

/// 创建一对出站队列端点。
///
/// `closed` 通常是进程关闭令牌的子令牌，取消它会立即关闭这个连接。
pub fn outbox(capacity: usize, closed: CancellationToken) -> (Outbox, OutboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        Outbox {
            tx,
            closed: closed.clone(),
        },
        OutboxReceiver { rx, closed },
    )
}

/// 出站队列的发送端
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<OutboundFrame>,
    closed: CancellationToken,
}

impl Outbox {
    /// 非阻塞入队
    pub fn try_send(&self, frame: OutboundFrame) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// 队列已满时最多等待 `timeout`
    pub async fn send_within(
        &self,
        frame: OutboundFrame,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(DeliveryError::Closed),
            result = self.tx.send_timeout(frame, timeout) => result.map_err(|err| match err {
                SendTimeoutError::Timeout(_) => DeliveryError::Timeout,
                SendTimeoutError::Closed(_) => DeliveryError::Closed,
            }),
        }
    }

    /// 关闭连接；幂等
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// 等待连接被关闭
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// 出站队列的接收端，由写任务持有
#[derive(Debug)]
pub struct OutboxReceiver {
    rx: mpsc::Receiver<OutboundFrame>,
    closed: CancellationToken,
}

impl OutboxReceiver {
    /// 取下一帧。
    ///
    /// 连接关闭后仍会先吐出已经入队的帧（例如鉴权失败的拒绝帧），
    /// 队列空了才返回 `None`。
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }

    /// 非阻塞地取一帧
    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 等待连接被关闭，写任务用它打断卡住的 socket 写入
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// 一个已鉴权的活动连接
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    outbox: Outbox,
}

impl Connection {
    pub fn new(user_id: UserId, outbox: Outbox) -> Self {
        Self {
            id: ConnectionId::generate(),
            user_id,
            outbox,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn try_deliver(&self, frame: OutboundFrame) -> Result<(), DeliveryError> {
        self.outbox.try_send(frame)
    }

    pub async fn deliver_within(
        &self,
        frame: OutboundFrame,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        self.outbox.send_within(frame, timeout).await
    }

    /// 立即关闭连接；读循环与写任务都会观察到；幂等
    pub fn close(&self) {
        self.outbox.close();
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    pub async fn closed(&self) {
        self.outbox.closed().await
    }
}
