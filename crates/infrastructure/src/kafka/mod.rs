//! Kafka 复制总线
//!
//! 以房间ID为分区键，保证同一房间的事件有序。每个实例使用独立的消费者组，
//! 因此每个实例都会收到全部事件，由复制总线按来源实例做回环抑制。

pub mod error;
pub mod transport;

// 重新导出
pub use error::*;
pub use transport::*;
