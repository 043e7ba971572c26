#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use application::{
    Backoff, ConnectionHandler, ConnectionRegistry, ConsumerHandle, FanoutPublisher,
    HandlerDependencies, InMemoryBus, MessageStore, PublisherHandle, ReplicationBus,
    RoomBroadcaster, StoreError, SystemClock,
};
use async_trait::async_trait;
use chrono::Utc;
use domain::{InstanceId, MessageId, MessageRecord, RoomId, UserId};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use web_api::{router, AppState, JwtConfig, JwtService};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 内存消息仓储
#[derive(Default)]
pub struct MemoryStore {
    members: Mutex<HashSet<(RoomId, UserId)>>,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn with_members(members: &[(i64, i64)]) -> Arc<Self> {
        let store = Self::default();
        {
            let mut set = store.members.lock().unwrap();
            for (room, user) in members {
                set.insert((RoomId::new(*room), UserId::new(*user)));
            }
        }
        Arc::new(store)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn check_membership(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self.members.lock().unwrap().contains(&(room_id, user_id)))
    }

    async fn create(
        &self,
        room_id: RoomId,
        user_id: UserId,
        content: &str,
    ) -> Result<MessageRecord, StoreError> {
        let now = Utc::now();
        Ok(MessageRecord {
            id: MessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
            room_id,
            user_id,
            username: format!("user{}", user_id),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn username(&self, user_id: UserId) -> Result<String, StoreError> {
        Ok(format!("user{}", user_id))
    }
}

pub fn jwt_service() -> JwtService {
    JwtService::new(JwtConfig::default())
}

pub fn token_for(user: i64) -> String {
    jwt_service()
        .generate_token(UserId::new(user))
        .expect("generate token")
}

/// 一个监听在随机端口上的服务实例
pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<ConnectionRegistry>,
    pub shutdown: CancellationToken,
    consumer: Option<ConsumerHandle>,
    publisher: Option<PublisherHandle>,
}

impl TestServer {
    pub async fn spawn(name: &str, hub: &InMemoryBus, store: Arc<MemoryStore>) -> Self {
        let instance = InstanceId::new(name);
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = RoomBroadcaster::new(registry.clone(), Duration::from_millis(50));
        let bus = Arc::new(ReplicationBus::new(
            instance.clone(),
            Arc::new(hub.attach()),
            broadcaster.clone(),
            Backoff::exponential(Duration::from_millis(10), Duration::from_millis(100)),
        ));
        let shutdown = CancellationToken::new();
        let (publisher, publisher_task) = FanoutPublisher::spawn(bus.clone(), 64, &shutdown);
        let handler = ConnectionHandler::new(HandlerDependencies {
            registry: registry.clone(),
            broadcaster,
            publisher,
            auth: Arc::new(jwt_service()),
            store,
            clock: Arc::new(SystemClock),
        });

        let consumer = Some(bus.spawn_consumer(&shutdown));
        let state = AppState::new(handler, instance, shutdown.clone(), 16);
        let app = router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let graceful = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { graceful.cancelled().await })
                .await
                .ok();
        });

        Self {
            addr,
            registry,
            shutdown,
            consumer,
            publisher: Some(publisher_task),
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn connect(&self, token: &str) -> WsClient {
        let url = format!("ws://{}/api/v1/ws?token={}", self.addr, token);
        let (socket, _) = connect_async(url).await.expect("websocket connect");
        socket
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(consumer) = self.consumer.take() {
            consumer.stop().await;
        }
        if let Some(publisher) = self.publisher.take() {
            publisher.stop().await;
        }
    }
}

pub async fn send_json(socket: &mut WsClient, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

/// 读取下一个 JSON 文本帧，跳过控制帧
pub async fn next_json(socket: &mut WsClient) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(3), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

/// 在给定时间内没有新的文本帧
pub async fn assert_no_text(socket: &mut WsClient, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, socket.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {text}"),
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("socket ended unexpectedly: {other:?}"),
        }
    }
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
