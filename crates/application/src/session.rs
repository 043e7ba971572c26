//! 单个连接的协议状态机
//!
//! `Connecting → Authenticating → Active → Closed`。握手完成后先校验凭证，
//! 失败时只回一个 `UNAUTHORIZED` 错误帧并关闭，连接永远不会进入注册表；
//! 成功后注册并进入读循环，按帧类型分发。读循环结束（客户端关闭、读错误、
//! 被广播器驱逐或进程关闭）后注销连接。

use std::sync::Arc;

use domain::{
    ClientFrame, ConnectionId, FanoutEvent, ProtocolError, RejectionCode, RoomId, ServerFrame,
    UserId,
};
use futures_util::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, AuthVerifier};
use crate::broadcaster::RoomBroadcaster;
use crate::clock::Clock;
use crate::connection::{Connection, InboundFrame, OutboundFrame, Outbox};
use crate::error::ConnectionError;
use crate::registry::ConnectionRegistry;
use crate::publisher::FanoutPublisher;
use crate::store::MessageStore;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Active,
    Closed,
}

/// 连接关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 凭证校验失败，从未注册
    AuthRejected,
    /// 客户端主动关闭或输入流结束
    ClientClosed,
    /// 读取失败
    ReadError,
    /// 服务端关闭：被广播器驱逐或进程关闭
    ServerClosed,
}

/// 一个连接从握手到关闭的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// 未通过鉴权时为空
    pub connection_id: Option<ConnectionId>,
    pub user_id: Option<UserId>,
    pub state: ConnectionState,
    pub reason: CloseReason,
}

/// 连接处理器依赖
pub struct HandlerDependencies {
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: RoomBroadcaster,
    pub publisher: FanoutPublisher,
    pub auth: Arc<dyn AuthVerifier>,
    pub store: Arc<dyn MessageStore>,
    pub clock: Arc<dyn Clock>,
}

/// 每个连接共享同一个处理器，各自调用一次 [`ConnectionHandler::run`]
#[derive(Clone)]
pub struct ConnectionHandler {
    deps: Arc<HandlerDependencies>,
}

impl ConnectionHandler {
    pub fn new(deps: HandlerDependencies) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.deps.registry
    }

    pub fn publisher(&self) -> &FanoutPublisher {
        &self.deps.publisher
    }

    /// 驱动一个已完成握手的连接直到关闭。
    ///
    /// `inbound` 是从 socket 读出的帧流；`outbox` 是该连接出站队列的发送端，
    /// 对应的接收端由传输层的写任务持有。
    pub async fn run<S>(
        &self,
        credential: Option<&str>,
        inbound: S,
        outbox: Outbox,
    ) -> SessionOutcome
    where
        S: Stream<Item = Result<InboundFrame, ConnectionError>> + Unpin + Send,
    {
        let mut state = ConnectionState::Connecting;
        debug!(?state, "websocket handshake accepted");
        state = ConnectionState::Authenticating;

        let user_id = match self.authenticate(credential).await {
            Ok(user_id) => user_id,
            Err(err) => {
                warn!(error = %err, "websocket authentication failed");
                let frame =
                    ServerFrame::rejection(RejectionCode::Unauthorized, err.to_string(), None);
                if let Ok(text) = frame.to_text() {
                    let _ = outbox.try_send(OutboundFrame::text(text));
                }
                outbox.close();
                return SessionOutcome {
                    connection_id: None,
                    user_id: None,
                    state: ConnectionState::Closed,
                    reason: CloseReason::AuthRejected,
                };
            }
        };
        debug!(?state, user_id = %user_id, "credential verified");

        let connection = Arc::new(Connection::new(user_id, outbox));
        self.deps.registry.register(Arc::clone(&connection));
        state = ConnectionState::Active;
        info!(connection_id = %connection.id(), user_id = %user_id, ?state, "connection active");

        let reason = self.read_loop(&connection, inbound).await;

        self.deps.registry.unregister(connection.id());
        connection.close();
        state = ConnectionState::Closed;
        info!(
            connection_id = %connection.id(),
            user_id = %user_id,
            ?reason,
            ?state,
            "connection closed"
        );

        SessionOutcome {
            connection_id: Some(connection.id()),
            user_id: Some(user_id),
            state,
            reason,
        }
    }

    async fn authenticate(&self, credential: Option<&str>) -> Result<UserId, AuthError> {
        let credential = credential
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::MissingCredential)?;
        self.deps.auth.verify(credential).await
    }

    async fn read_loop<S>(&self, connection: &Connection, mut inbound: S) -> CloseReason
    where
        S: Stream<Item = Result<InboundFrame, ConnectionError>> + Unpin + Send,
    {
        loop {
            let next = tokio::select! {
                biased;
                _ = connection.closed() => return CloseReason::ServerClosed,
                next = inbound.next() => next,
            };

            match next {
                None | Some(Ok(InboundFrame::Close)) => return CloseReason::ClientClosed,
                Some(Err(err)) => {
                    warn!(connection_id = %connection.id(), error = %err, "websocket read failed");
                    return CloseReason::ReadError;
                }
                Some(Ok(InboundFrame::Text(text))) => self.dispatch(connection, &text).await,
                Some(Ok(InboundFrame::Binary(bytes))) => {
                    let err = ProtocolError::unsupported("binary");
                    warn!(
                        connection_id = %connection.id(),
                        len = bytes.len(),
                        error = %err,
                        "skip frame"
                    );
                }
                // WebSocket 层自动应答 ping
                Some(Ok(InboundFrame::Ping | InboundFrame::Pong)) => {}
            }
        }
    }

    async fn dispatch(&self, connection: &Connection, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id = %connection.id(), error = %err, "skip malformed frame");
                return;
            }
        };
        debug!(
            connection_id = %connection.id(),
            kind = frame.kind(),
            room_id = %frame.room_id(),
            "frame received"
        );

        match frame {
            ClientFrame::JoinRoom { room_id } => self.join_room(connection, room_id).await,
            ClientFrame::LeaveRoom { room_id } => {
                self.deps.registry.leave(room_id, connection.id());
            }
            ClientFrame::SendMessage { room_id, content } => {
                self.send_message(connection, room_id, &content).await
            }
        }
    }

    async fn join_room(&self, connection: &Connection, room_id: RoomId) {
        if !self.deps.registry.join(room_id, connection.id()) {
            // 已被驱逐，读循环下一轮会退出
            return;
        }

        let user_id = connection.user_id();
        let username = match self.deps.store.username(user_id).await {
            Ok(username) => username,
            Err(err) => {
                warn!(
                    user_id = %user_id,
                    error = %err,
                    "failed to look up username, skip join notice"
                );
                return;
            }
        };

        let notice = ServerFrame::UserJoined {
            user_id,
            username,
            room_id,
            time: self.deps.clock.now(),
        };
        match notice.to_text() {
            Ok(text) => {
                self.deps.broadcaster.broadcast(room_id, Arc::from(text)).await;
            }
            Err(err) => error!(error = %err, "failed to encode user_joined frame"),
        }
    }

    async fn send_message(&self, connection: &Connection, room_id: RoomId, content: &str) {
        let user_id = connection.user_id();

        match self.deps.store.check_membership(room_id, user_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.reject(
                    connection,
                    RejectionCode::NotRoomMember,
                    "user is not a member of this room",
                    room_id,
                );
                return;
            }
            Err(err) => {
                warn!(
                    room_id = %room_id,
                    user_id = %user_id,
                    error = %err,
                    "membership check failed"
                );
                self.reject(connection, RejectionCode::StoreError, err.to_string(), room_id);
                return;
            }
        }

        let record = match self.deps.store.create(room_id, user_id, content).await {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    room_id = %room_id,
                    user_id = %user_id,
                    error = %err,
                    "failed to persist message"
                );
                self.reject(connection, RejectionCode::StoreError, err.to_string(), room_id);
                return;
            }
        };
        let message_id = record.id;

        let text = match ServerFrame::NewMessage(record).to_text() {
            Ok(text) => text,
            Err(err) => {
                error!(error = %err, "failed to encode new_message frame");
                return;
            }
        };
        let event = FanoutEvent::message_posted(
            self.deps.publisher.instance().clone(),
            room_id,
            text.clone(),
            self.deps.clock.now(),
        );

        // 本地广播不依赖发布结果
        let report = self.deps.broadcaster.broadcast(room_id, Arc::from(text)).await;
        debug!(
            room_id = %room_id,
            message_id = %message_id,
            delivered = report.delivered,
            "message broadcast locally"
        );

        // 只入队，不等待总线
        if let Err(err) = self.deps.publisher.enqueue(event) {
            warn!(
                room_id = %room_id,
                message_id = %message_id,
                error = %err,
                "failed to queue fanout event, delivered locally only"
            );
        }
    }

    fn reject(
        &self,
        connection: &Connection,
        code: RejectionCode,
        message: impl Into<String>,
        room_id: RoomId,
    ) {
        let frame = ServerFrame::rejection(code, message, Some(room_id));
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(err) => {
                error!(error = %err, "failed to encode error frame");
                return;
            }
        };
        if let Err(err) = connection.try_deliver(OutboundFrame::text(text)) {
            debug!(connection_id = %connection.id(), error = %err, "rejection dropped");
        }
    }
}
