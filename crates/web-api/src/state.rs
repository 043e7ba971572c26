use std::sync::Arc;

use application::{ConnectionHandler, ConnectionRegistry};
use domain::InstanceId;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub handler: ConnectionHandler,
    pub instance: InstanceId,
    /// 取消时关闭所有连接
    pub shutdown: CancellationToken,
    /// 每个连接的出站队列容量
    pub outbound_capacity: usize,
}

impl AppState {
    pub fn new(
        handler: ConnectionHandler,
        instance: InstanceId,
        shutdown: CancellationToken,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            handler,
            instance,
            shutdown,
            outbound_capacity,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.handler.registry()
    }
}
