//! 基础设施层实现。
//!
//! 提供 PostgreSQL 消息仓储与 Kafka 复制总线传输，实现应用层定义的接口。

pub mod kafka;
pub mod migrations;
pub mod store;

pub use kafka::{consumer_group_id, KafkaBusTransport, KafkaError, KafkaResult};
pub use migrations::MIGRATOR;
pub use store::{create_pg_pool, PgMessageStore};
