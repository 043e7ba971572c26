#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use application::{
    outbox, AuthError, AuthVerifier, Backoff, BusError, BusTransport, ConnectionError,
    ConnectionHandler, ConnectionRegistry, ConsumerHandle, FanoutPublisher, HandlerDependencies,
    InMemoryBus, InMemoryBusEndpoint, InboundFrame, MessageStore, OutboundFrame, OutboxReceiver,
    PublisherHandle, ReplicationBus, RoomBroadcaster, SessionOutcome, StoreError, SystemClock,
};
use async_trait::async_trait;
use chrono::Utc;
use domain::{InstanceId, MessageId, MessageRecord, RoomId, UserId};
use futures::channel::mpsc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DELIVERY_TIMEOUT: Duration = Duration::from_millis(30);
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);
pub const PUBLISH_QUEUE: usize = 64;

/// 凭证格式为 `user-<id>`
#[derive(Default)]
pub struct FakeAuth;

#[async_trait]
impl AuthVerifier for FakeAuth {
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError> {
        credential
            .strip_prefix("user-")
            .and_then(|id| id.parse::<i64>().ok())
            .map(UserId::new)
            .ok_or_else(|| AuthError::Invalid("unknown token".to_string()))
    }
}

/// 内存消息仓储，可注入失败
#[derive(Default)]
pub struct FakeStore {
    members: Mutex<HashSet<(RoomId, UserId)>>,
    next_id: AtomicI64,
    created: AtomicUsize,
    fail_membership: AtomicBool,
    fail_create: AtomicBool,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_member(&self, room: i64, user: i64) {
        self.members
            .lock()
            .unwrap()
            .insert((RoomId::new(room), UserId::new(user)));
    }

    pub fn fail_membership(&self, fail: bool) {
        self.fail_membership.store(fail, Ordering::SeqCst);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for FakeStore {
    async fn check_membership(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        if self.fail_membership.load(Ordering::SeqCst) {
            return Err(StoreError::storage("membership lookup unavailable"));
        }
        Ok(self.members.lock().unwrap().contains(&(room_id, user_id)))
    }

    async fn create(
        &self,
        room_id: RoomId,
        user_id: UserId,
        content: &str,
    ) -> Result<MessageRecord, StoreError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(StoreError::storage("insert failed"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
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

/// 发送总是失败；接收先失败若干次再转给内存总线
pub struct FlakyTransport {
    inner: InMemoryBusEndpoint,
    fail_sends: AtomicBool,
    recv_failures_left: AtomicUsize,
    recv_failures_seen: AtomicUsize,
}

impl FlakyTransport {
    pub fn new(inner: InMemoryBusEndpoint, recv_failures: usize) -> Self {
        Self {
            inner,
            fail_sends: AtomicBool::new(false),
            recv_failures_left: AtomicUsize::new(recv_failures),
            recv_failures_seen: AtomicUsize::new(0),
        }
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn recv_failures_seen(&self) -> usize {
        self.recv_failures_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusTransport for FlakyTransport {
    async fn send(&self, key: &str, bytes: Vec<u8>) -> Result<(), BusError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BusError::publish("broker unavailable"));
        }
        self.inner.send(key, bytes).await
    }

    async fn recv(&self) -> Result<Vec<u8>, BusError> {
        let left = self.recv_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.recv_failures_left.store(left - 1, Ordering::SeqCst);
            self.recv_failures_seen.fetch_add(1, Ordering::SeqCst);
            return Err(BusError::consume("broker unavailable"));
        }
        self.inner.recv().await
    }
}

/// 每次发送都挂起 `stall` 后失败，模拟不可用的 broker
pub struct HangingTransport {
    inner: InMemoryBusEndpoint,
    stall: Duration,
}

impl HangingTransport {
    pub fn new(inner: InMemoryBusEndpoint, stall: Duration) -> Self {
        Self { inner, stall }
    }
}

#[async_trait]
impl BusTransport for HangingTransport {
    async fn send(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), BusError> {
        tokio::time::sleep(self.stall).await;
        Err(BusError::publish("message timed out"))
    }

    async fn recv(&self) -> Result<Vec<u8>, BusError> {
        self.inner.recv().await
    }
}

pub fn test_backoff() -> Backoff {
    Backoff::exponential(Duration::from_millis(5), Duration::from_millis(20))
}

/// 一个完整的服务实例：注册表、广播器、复制总线与连接处理器
pub struct TestInstance {
    pub instance: InstanceId,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: RoomBroadcaster,
    pub bus: Arc<ReplicationBus>,
    pub handler: ConnectionHandler,
    pub publisher: FanoutPublisher,
    pub shutdown: CancellationToken,
    consumer: Option<ConsumerHandle>,
    publisher_task: Option<PublisherHandle>,
}

impl TestInstance {
    pub fn on_hub(name: &str, hub: &InMemoryBus, store: Arc<FakeStore>) -> Self {
        Self::with_transport(name, Arc::new(hub.attach()), store)
    }

    pub fn with_transport(
        name: &str,
        transport: Arc<dyn BusTransport>,
        store: Arc<FakeStore>,
    ) -> Self {
        let instance = InstanceId::new(name);
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = RoomBroadcaster::new(registry.clone(), DELIVERY_TIMEOUT);
        let bus = Arc::new(ReplicationBus::new(
            instance.clone(),
            transport,
            broadcaster.clone(),
            test_backoff(),
        ));
        let shutdown = CancellationToken::new();
        let (publisher, publisher_task) =
            FanoutPublisher::spawn(bus.clone(), PUBLISH_QUEUE, &shutdown);
        let handler = ConnectionHandler::new(HandlerDependencies {
            registry: registry.clone(),
            broadcaster: broadcaster.clone(),
            publisher: publisher.clone(),
            auth: Arc::new(FakeAuth),
            store,
            clock: Arc::new(SystemClock),
        });
        let consumer = Some(bus.spawn_consumer(&shutdown));

        Self {
            instance,
            registry,
            broadcaster,
            bus,
            handler,
            publisher,
            shutdown,
            consumer,
            publisher_task: Some(publisher_task),
        }
    }

    pub async fn stop_consumer(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.stop().await;
        }
    }

    pub async fn stop_publisher(&mut self) {
        if let Some(publisher) = self.publisher_task.take() {
            publisher.stop().await;
        }
    }

    pub fn connect(&self, token: Option<&str>) -> TestClient {
        let (frames, inbound) = mpsc::unbounded();
        let (tx, rx) = outbox(16, self.shutdown.child_token());
        let handler = self.handler.clone();
        let token = token.map(str::to_string);
        let session = tokio::spawn(async move { handler.run(token.as_deref(), inbound, tx).await });
        TestClient {
            frames,
            outbound: rx,
            session,
        }
    }
}

/// 模拟一个客户端：向处理器喂入帧，从出站队列读回帧
pub struct TestClient {
    frames: mpsc::UnboundedSender<Result<InboundFrame, ConnectionError>>,
    pub outbound: OutboxReceiver,
    session: JoinHandle<SessionOutcome>,
}

impl TestClient {
    pub fn send_raw(&self, frame: InboundFrame) {
        let _ = self.frames.unbounded_send(Ok(frame));
    }

    pub fn send_json(&self, value: Value) {
        self.send_raw(InboundFrame::Text(value.to_string()));
    }

    pub fn fail_read(&self) {
        let _ = self
            .frames
            .unbounded_send(Err(ConnectionError::Read("connection reset".to_string())));
    }

    /// 加入房间并等待自己收到的 `user_joined`
    pub async fn join(&mut self, room: i64) -> Value {
        self.send_json(json!({"type": "join_room", "payload": {"roomId": room}}));
        let frame = self.next_frame().await;
        assert_eq!(frame["type"], "user_joined");
        assert_eq!(frame["payload"]["roomId"], room);
        frame
    }

    pub fn leave(&self, room: i64) {
        self.send_json(json!({"type": "leave_room", "payload": {"roomId": room}}));
    }

    pub fn say(&self, room: i64, content: &str) {
        self.send_json(json!({
            "type": "send_message",
            "payload": {"roomId": room, "content": content}
        }));
    }

    pub async fn next_outbound(&mut self) -> Option<OutboundFrame> {
        tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for an outbound frame")
    }

    pub async fn next_frame(&mut self) -> Value {
        match self.next_outbound().await {
            Some(OutboundFrame::Text(text)) => {
                serde_json::from_str(&text).expect("outbound frame is json")
            }
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// 在给定时间内没有收到任何帧
    pub async fn assert_silent(&mut self, wait: Duration) {
        if let Ok(frame) = tokio::time::timeout(wait, self.outbound.recv()).await {
            panic!("unexpected outbound frame: {frame:?}");
        }
    }

    pub async fn close(self) -> SessionOutcome {
        let _ = self.frames.unbounded_send(Ok(InboundFrame::Close));
        self.finish().await
    }

    pub async fn finish(self) -> SessionOutcome {
        tokio::time::timeout(RECV_TIMEOUT, self.session)
            .await
            .expect("session did not finish")
            .expect("session task panicked")
    }
}

/// 轮询直到条件成立
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
