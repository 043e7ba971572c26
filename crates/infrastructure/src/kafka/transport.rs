//! 基于 Kafka 的总线传输
//!
//! 生产端使用房间ID作为消息键；消费端以 `{prefix}-{instance_id}` 为消费者组，
//! 从最新位置开始消费，实例重启不会重放历史事件。

use std::time::Duration;

use application::{Backoff, BusError, BusTransport};
use async_trait::async_trait;
use config::KafkaConfig;
use domain::InstanceId;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::kafka::{KafkaError, KafkaResult};

/// 生成实例专属的消费者组ID
pub fn consumer_group_id(prefix: &str, instance: &InstanceId) -> String {
    format!("{}-{}", prefix, instance)
}

/// Kafka 总线传输：一个生产者加一个订阅了扇出主题的消费者
pub struct KafkaBusTransport {
    producer: FutureProducer,
    consumer: StreamConsumer,
    topic: String,
    send_timeout: Duration,
    retry_count: u32,
    retry_backoff: Backoff,
}

impl KafkaBusTransport {
    /// 创建生产者与消费者并订阅主题
    pub fn new(config: &KafkaConfig, instance: &InstanceId) -> KafkaResult<Self> {
        let brokers = config.brokers.join(",");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", config.send_timeout_ms.to_string())
            .set("acks", &config.acks)
            .set("linger.ms", config.linger_ms.to_string())
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "5")
            .create()
            .map_err(|e| KafkaError::ConfigError {
                message: format!("创建 Kafka 生产者失败: {}", e),
            })?;

        let group_id = consumer_group_id(&config.consumer_group_prefix, instance);
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &group_id)
            .set("bootstrap.servers", &brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "10000")
            .set("heartbeat.interval.ms", "3000")
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "1000")
            .set("auto.offset.reset", "latest")
            .set("fetch.wait.max.ms", "100")
            .create()
            .map_err(|e| KafkaError::ConfigError {
                message: format!("创建 Kafka 消费者失败: {}", e),
            })?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| KafkaError::ConsumerError {
                message: format!("订阅主题失败: {}", e),
            })?;

        info!(brokers = %brokers, topic = %config.topic, group_id = %group_id, "Kafka 总线已连接");

        Ok(Self {
            producer,
            consumer,
            topic: config.topic.clone(),
            send_timeout: Duration::from_millis(u64::from(config.send_timeout_ms)),
            retry_count: config.retry_count,
            retry_backoff: Backoff::exponential(Duration::from_millis(100), Duration::from_secs(2)),
        })
    }

    /// 带重试的发送
    async fn send_with_retry(&self, key: &str, payload: &[u8], retry_count: u32) -> KafkaResult<()> {
        let record = FutureRecord::to(&self.topic).payload(payload).key(key);

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok(_) => {
                if retry_count > 0 {
                    info!(key, retry_count, "事件重试后发送成功");
                }
                Ok(())
            }
            Err((kafka_err, _)) => {
                if retry_count < self.retry_count {
                    warn!(key, attempt = retry_count + 1, error = %kafka_err, "事件发送失败，准备重试");

                    // 指数退避
                    sleep(self.retry_backoff.delay_at(retry_count + 1)).await;

                    // 使用 Box::pin 来处理递归
                    return Box::pin(self.send_with_retry(key, payload, retry_count + 1)).await;
                }

                error!(key, error = %kafka_err, "事件发送失败，已达最大重试次数");
                Err(KafkaError::ProducerError {
                    message: format!("发送失败: {}", kafka_err),
                })
            }
        }
    }

    /// 刷新生产者缓冲区，关闭前调用
    pub fn flush(&self, timeout: Duration) -> KafkaResult<()> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| KafkaError::ProducerError {
                message: format!("刷新生产者缓冲区失败: {}", e),
            })
    }
}

#[async_trait]
impl BusTransport for KafkaBusTransport {
    async fn send(&self, key: &str, bytes: Vec<u8>) -> Result<(), BusError> {
        self.send_with_retry(key, &bytes, 0).await.map_err(BusError::from)
    }

    async fn recv(&self) -> Result<Vec<u8>, BusError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| BusError::from(KafkaError::from(e)))?;

        debug!(
            partition = message.partition(),
            offset = message.offset(),
            "fanout record received"
        );
        // 空负载交给上层按无法解码处理
        Ok(message.payload().unwrap_or_default().to_vec())
    }
}
