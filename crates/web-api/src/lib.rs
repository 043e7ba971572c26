//! Web API 层。
//!
//! 提供 Axum 路由：健康检查与 WebSocket 入口，连接交给应用层的连接处理器。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{bearer_token, Claims, JwtService};
pub use config::JwtConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
