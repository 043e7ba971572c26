// 进程内复制总线，单实例部署与测试使用
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use crate::error::BusError;
use crate::replication::BusTransport;

const DEFAULT_CAPACITY: usize = 1024;

/// 进程内的总线中枢。每个 [`InMemoryBusEndpoint`] 相当于一个独立实例的连接，
/// 所有端点都会收到所有记录（包括自己发出的），顺序与发送顺序一致。
#[derive(Clone)]
pub struct InMemoryBus {
    sender: broadcast::Sender<Arc<[u8]>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 接入总线。只会收到接入之后发送的记录。
    pub fn attach(&self) -> InMemoryBusEndpoint {
        InMemoryBusEndpoint {
            sender: self.sender.clone(),
            receiver: Mutex::new(self.sender.subscribe()),
        }
    }

    /// 当前接入的端点数
    pub fn endpoints(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InMemoryBusEndpoint {
    sender: broadcast::Sender<Arc<[u8]>>,
    receiver: Mutex<broadcast::Receiver<Arc<[u8]>>>,
}

#[async_trait]
impl BusTransport for InMemoryBusEndpoint {
    async fn send(&self, _key: &str, bytes: Vec<u8>) -> Result<(), BusError> {
        // 至少有自己的接收端，发送不会因无订阅者失败
        self.sender
            .send(Arc::from(bytes))
            .map(|_| ())
            .map_err(|err| BusError::publish(err.to_string()))
    }

    async fn recv(&self) -> Result<Vec<u8>, BusError> {
        let mut receiver = self.receiver.lock().await;
        match receiver.recv().await {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(BusError::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => Err(BusError::Closed),
        }
    }
}
