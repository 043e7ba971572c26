//! 跨实例复制总线
//!
//! 每个实例把本地产生的 `message-posted` 事件发布到共享总线，同时消费所有实例
//! （包括自己）发布的事件。消费端先比较信封上的 `originInstance`：是自己发出的
//! 就丢弃（本地广播在发布之前已经完成），否则交给本实例的 [`RoomBroadcaster`]。
//!
//! 总线只保证同一个键（房间ID）内有序，消费循环是单个顺序执行的任务。

use std::sync::Arc;

use async_trait::async_trait;
use domain::{FanoutEvent, InstanceId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::broadcaster::{DeliveryReport, RoomBroadcaster};
use crate::error::BusError;
use crate::retry::Backoff;

/// 总线传输层，按键有序的发布/订阅
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// 把一条记录交给总线；返回时记录已被总线接收
    async fn send(&self, key: &str, bytes: Vec<u8>) -> Result<(), BusError>;

    /// 取下一条记录。`BusError::Closed` 表示传输已永久关闭。
    async fn recv(&self) -> Result<Vec<u8>, BusError>;
}

/// 单条记录的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// 来自其他实例，已在本地广播
    Broadcast(DeliveryReport),
    /// 本实例自己发出的回环事件
    Suppressed,
    /// 无法解码，已跳过
    Skipped,
}

pub struct ReplicationBus {
    instance: InstanceId,
    transport: Arc<dyn BusTransport>,
    broadcaster: RoomBroadcaster,
    backoff: Backoff,
}

impl ReplicationBus {
    pub fn new(
        instance: InstanceId,
        transport: Arc<dyn BusTransport>,
        broadcaster: RoomBroadcaster,
        backoff: Backoff,
    ) -> Self {
        Self {
            instance,
            transport,
            broadcaster,
            backoff,
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// 发布事件，以房间ID为键
    pub async fn publish(&self, event: &FanoutEvent) -> Result<(), BusError> {
        let bytes = event.encode()?;
        let key = event.partition_key();
        self.transport.send(&key, bytes).await?;
        debug!(
            room_id = %event.room_id,
            kind = ?event.kind,
            instance = %self.instance,
            "fanout event published"
        );
        Ok(())
    }

    /// 处理一条从总线收到的记录
    pub async fn handle_record(&self, bytes: &[u8]) -> ConsumeOutcome {
        let event = match FanoutEvent::decode(bytes) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, len = bytes.len(), "skip undecodable fanout record");
                return ConsumeOutcome::Skipped;
            }
        };

        if event.is_from(&self.instance) {
            trace!(room_id = %event.room_id, "suppress own fanout event");
            return ConsumeOutcome::Suppressed;
        }

        debug!(
            room_id = %event.room_id,
            origin = %event.origin_instance,
            age_ms = event.age_ms(),
            "remote fanout event received"
        );
        let report = self
            .broadcaster
            .broadcast(event.room_id, Arc::from(event.payload))
            .await;
        ConsumeOutcome::Broadcast(report)
    }

    /// 启动后台消费循环。`shutdown` 被取消或调用 [`ConsumerHandle::stop`] 时退出。
    pub fn spawn_consumer(self: &Arc<Self>, shutdown: &CancellationToken) -> ConsumerHandle {
        let token = shutdown.child_token();
        let bus = Arc::clone(self);
        let task = tokio::spawn(bus.consume_loop(token.clone()));
        info!(instance = %self.instance, "fanout consumer started");
        ConsumerHandle { token, task }
    }

    async fn consume_loop(self: Arc<Self>, token: CancellationToken) {
        let mut failures: u32 = 0;
        loop {
            let record = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                record = self.transport.recv() => record,
            };

            match record {
                Ok(bytes) => {
                    failures = 0;
                    // 已经取到的记录总是处理完，停止信号只在两条记录之间生效
                    self.handle_record(&bytes).await;
                }
                Err(BusError::Lagged(skipped)) => {
                    warn!(skipped, "fanout consumer lagged behind, events dropped");
                }
                Err(BusError::Closed) => {
                    warn!("bus transport closed, fanout consumer exiting");
                    break;
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = self.backoff.delay_at(failures);
                    error!(
                        error = %err,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "fanout consume failed"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!(instance = %self.instance, "fanout consumer stopped");
    }
}

/// 后台消费任务的句柄
pub struct ConsumerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// 停止消费：等待正在处理的记录完成后返回，此后不会再有远端事件被广播。
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(err) = self.task.await {
            error!(error = %err, "fanout consumer task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
