//! 主应用程序入口
//!
//! 加载配置，连接数据库与复制总线，启动 Axum Web 服务。

use std::{sync::Arc, time::Duration};

use application::{
    Backoff, BusTransport, ConnectionHandler, ConnectionRegistry, FanoutPublisher,
    HandlerDependencies, InMemoryBus, ReplicationBus, RoomBroadcaster, SystemClock,
};
use config::{AppConfig, BusBackend};
use domain::InstanceId;
use infrastructure::{create_pg_pool, KafkaBusTransport, PgMessageStore, MIGRATOR};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

/// 关闭时等待 Kafka 生产者刷出缓冲区的上限
const KAFKA_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    if config.jwt.is_development_secret() {
        tracing::warn!("正在使用开发用 JWT 密钥，请在生产环境中设置 CHATROOM_JWT__SECRET");
    }

    let instance = config
        .fanout
        .instance_id
        .as_deref()
        .map(InstanceId::new)
        .unwrap_or_else(InstanceId::generate);
    tracing::info!(instance = %instance, backend = ?config.bus.backend, "实例启动");

    tracing::info!(
        "连接数据库: {}",
        config.database.url.split('@').next_back().unwrap_or("unknown")
    );
    let pg_pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
    MIGRATOR.run(&pg_pool).await?;
    let store = Arc::new(PgMessageStore::new(pg_pool));

    // 选择复制总线后端
    let (transport, kafka): (Arc<dyn BusTransport>, Option<Arc<KafkaBusTransport>>) =
        match config.bus.backend {
            BusBackend::Kafka => {
                let kafka = Arc::new(KafkaBusTransport::new(&config.kafka, &instance)?);
                let transport: Arc<dyn BusTransport> = kafka.clone();
                (transport, Some(kafka))
            }
            BusBackend::Memory => (Arc::new(InMemoryBus::new().attach()), None),
        };

    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = RoomBroadcaster::new(
        registry.clone(),
        Duration::from_millis(config.fanout.delivery_timeout_ms),
    );
    let bus = Arc::new(ReplicationBus::new(
        instance.clone(),
        transport,
        broadcaster.clone(),
        Backoff::exponential(
            Duration::from_millis(config.fanout.consume_backoff_base_ms),
            Duration::from_millis(config.fanout.consume_backoff_max_ms),
        ),
    ));

    let shutdown = CancellationToken::new();
    let (publisher, publisher_task) = FanoutPublisher::spawn(
        bus.clone(),
        config.fanout.publish_queue_capacity,
        &shutdown,
    );

    let handler = ConnectionHandler::new(HandlerDependencies {
        registry,
        broadcaster,
        publisher,
        auth: Arc::new(JwtService::new(config.jwt.clone())),
        store,
        clock: Arc::new(SystemClock),
    });

    let consumer = bus.spawn_consumer(&shutdown);

    let state = AppState::new(
        handler,
        instance,
        shutdown.clone(),
        config.fanout.outbound_queue_capacity,
    );
    let app = router(state);

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("聊天室服务器启动在 http://{}", address);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal.cancel();
        })
        .await?;

    // 先停消费，再刷出尚未发送的事件
    shutdown.cancel();
    consumer.stop().await;
    publisher_task.stop().await;
    if let Some(kafka) = kafka {
        if let Err(err) = kafka.flush(KAFKA_FLUSH_TIMEOUT) {
            tracing::warn!(error = %err, "Kafka 缓冲区未能完全刷出");
        }
    }

    tracing::info!("服务器已关闭");
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "监听 Ctrl+C 失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig_term) => {
                sig_term.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "监听终止信号失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("接收到 Ctrl+C 信号，开始优雅停机..."),
        _ = terminate => tracing::info!("接收到终止信号，开始优雅停机..."),
    }
}
