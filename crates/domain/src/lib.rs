//! 聊天室扇出子系统的核心领域模型
//!
//! 包含标识类型、规范化消息记录、客户端/服务端帧协议以及跨实例复制事件。

pub mod errors;
pub mod fanout;
pub mod message;
pub mod value_objects;
pub mod websocket;

// 重新导出常用类型
pub use errors::*;
pub use fanout::*;
pub use message::*;
pub use value_objects::*;
pub use websocket::*;
