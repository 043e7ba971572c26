//! 本实例内的房间广播
//!
//! 先对房间取快照，再逐个连接独立投递。单个连接失败（队列关闭、等待超时）
//! 只会关闭并注销这一个连接，不会中断或拖慢对其余连接的投递。

use std::sync::Arc;
use std::time::Duration;

use domain::{ConnectionId, RoomId};
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::connection::{Connection, OutboundFrame};
use crate::error::DeliveryError;
use crate::registry::ConnectionRegistry;

/// 一次广播的投递结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub room_id: RoomId,
    /// 快照中的连接数
    pub attempted: usize,
    pub delivered: usize,
    /// 投递失败并被驱逐的连接
    pub dropped: Vec<ConnectionId>,
}

impl DeliveryReport {
    fn new(room_id: RoomId, attempted: usize) -> Self {
        Self {
            room_id,
            attempted,
            delivered: 0,
            dropped: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.dropped.is_empty() && self.delivered == self.attempted
    }
}

/// 房间广播器
#[derive(Clone)]
pub struct RoomBroadcaster {
    registry: Arc<ConnectionRegistry>,
    delivery_timeout: Duration,
}

impl RoomBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, delivery_timeout: Duration) -> Self {
        Self {
            registry,
            delivery_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// 向房间内本实例持有的所有连接投递 `payload`。
    ///
    /// 队列有空位的连接立即入队；队列已满的连接并发地等待至多
    /// `delivery_timeout`，超时即被驱逐。空房间是成功的无操作。
    pub async fn broadcast(&self, room_id: RoomId, payload: Arc<str>) -> DeliveryReport {
        let members = self.registry.snapshot_room(room_id);
        let mut report = DeliveryReport::new(room_id, members.len());
        if members.is_empty() {
            debug!(room_id = %room_id, "no local members, skip broadcast");
            return report;
        }

        let mut backlogged = Vec::new();
        for connection in members {
            match connection.try_deliver(OutboundFrame::Text(Arc::clone(&payload))) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::QueueFull) => backlogged.push(connection),
                Err(err) => {
                    self.evict(&connection, err);
                    report.dropped.push(connection.id());
                }
            }
        }

        if !backlogged.is_empty() {
            let timeout = self.delivery_timeout;
            let results = join_all(backlogged.iter().map(|connection| {
                connection.deliver_within(OutboundFrame::Text(Arc::clone(&payload)), timeout)
            }))
            .await;

            for (connection, result) in backlogged.iter().zip(results) {
                match result {
                    Ok(()) => report.delivered += 1,
                    Err(err) => {
                        self.evict(connection, err);
                        report.dropped.push(connection.id());
                    }
                }
            }
        }

        debug!(
            room_id = %room_id,
            attempted = report.attempted,
            delivered = report.delivered,
            dropped = report.dropped.len(),
            "room broadcast finished"
        );
        report
    }

    /// 关闭并注销一个投递失败的连接。连接自己的读循环会观察到关闭并完成剩余清理。
    fn evict(&self, connection: &Connection, reason: DeliveryError) {
        warn!(
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            error = %reason,
            "evicting connection after failed delivery"
        );
        connection.close();
        self.registry.unregister(connection.id());
    }
}
