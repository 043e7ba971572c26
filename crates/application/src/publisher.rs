//! 复制事件发布队列
//!
//! 连接的读循环只把事件放进本实例共享的有界队列，由单个后台任务按入队顺序
//! 依次交给 [`ReplicationBus::publish`]。总线不可用时阻塞的只有这个任务，
//! 连接自己的本地广播、加入和离开照常进行。

use std::sync::Arc;

use domain::{FanoutEvent, InstanceId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::BusError;
use crate::replication::ReplicationBus;

/// 发布队列的入队端，可在连接之间共享
#[derive(Clone)]
pub struct FanoutPublisher {
    instance: InstanceId,
    tx: mpsc::Sender<FanoutEvent>,
}

impl FanoutPublisher {
    /// 创建队列并启动发布任务。`shutdown` 被取消或调用 [`PublisherHandle::stop`] 时退出。
    pub fn spawn(
        bus: Arc<ReplicationBus>,
        capacity: usize,
        shutdown: &CancellationToken,
    ) -> (Self, PublisherHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let token = shutdown.child_token();
        let instance = bus.instance().clone();
        let task = tokio::spawn(publish_loop(bus, rx, token.clone()));
        info!(instance = %instance, capacity, "fanout publisher started");

        (Self { instance, tx }, PublisherHandle { token, task })
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// 非阻塞入队。队列已满说明总线长时间不可用，事件直接丢弃。
    pub fn enqueue(&self, event: FanoutEvent) -> Result<(), BusError> {
        self.tx.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => BusError::publish("publish queue is full"),
            TrySendError::Closed(_) => BusError::Closed,
        })
    }
}

async fn publish_loop(
    bus: Arc<ReplicationBus>,
    mut rx: mpsc::Receiver<FanoutEvent>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        // 卡住的发布不能拖住关闭
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = bus.publish(&event) => result,
        };
        if let Err(err) = result {
            warn!(
                room_id = %event.room_id,
                error = %err,
                "failed to publish fanout event, delivered locally only"
            );
        }
    }

    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!(dropped, "fanout publisher stopped with unpublished events");
    }
    debug!("fanout publisher stopped");
}

/// 后台发布任务的句柄
pub struct PublisherHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl PublisherHandle {
    /// 停止发布任务；正在进行的发布会被放弃
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            error!(error = %err, "fanout publisher task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
