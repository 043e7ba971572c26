//! 应用层实现。
//!
//! 单个实例内的连接注册表与房间广播、跨实例复制总线，以及每个连接的协议状态机。
//! 外部能力（凭证校验、消息持久化、总线传输）以 trait 形式抽象，由基础设施层实现。

pub mod auth;
pub mod broadcaster;
pub mod clock;
pub mod connection;
pub mod error;
pub mod local_broadcast;
pub mod publisher;
pub mod registry;
pub mod replication;
pub mod retry;
pub mod session;
pub mod store;

pub use auth::{AuthError, AuthVerifier};
pub use broadcaster::{DeliveryReport, RoomBroadcaster};
pub use clock::{Clock, SystemClock};
pub use connection::{outbox, Connection, InboundFrame, OutboundFrame, Outbox, OutboxReceiver};
pub use error::{BusError, ConnectionError, DeliveryError};
pub use local_broadcast::{InMemoryBus, InMemoryBusEndpoint};
pub use publisher::{FanoutPublisher, PublisherHandle};
pub use registry::{ConnectionRegistry, RegistryStats};
pub use replication::{BusTransport, ConsumeOutcome, ConsumerHandle, ReplicationBus};
pub use retry::Backoff;
pub use session::{
    CloseReason, ConnectionHandler, ConnectionState, HandlerDependencies, SessionOutcome,
};
pub use store::{MessageStore, StoreError};
