use std::time::Duration;

use application::{outbox, ConnectionError, InboundFrame, OutboundFrame, Outbox, OutboxReceiver};
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};

use crate::state::AppState;

/// 连接关闭后，剩余写入（例如拒绝帧、关闭帧）最多再等待的时间
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsSender = SplitSink<WebSocket, WsMessage>;

/// WebSocket 连接
///
/// 把 socket 拆成读写两半：读半边转换为 [`InboundFrame`] 流交给连接处理器，
/// 写半边由专用写任务从出站队列取帧写出。
pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
    credential: Option<String>,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, state: AppState, credential: Option<String>) -> Self {
        Self {
            socket,
            state,
            credential,
        }
    }

    /// 运行连接直到关闭
    pub async fn run(self) {
        let (sender, incoming) = self.socket.split();
        let (outbox, outbound) = outbox(
            self.state.outbound_capacity,
            self.state.shutdown.child_token(),
        );

        let writer = tokio::spawn(write_loop(sender, outbound, outbox.clone()));

        let inbound = incoming.map(|message| {
            message
                .map(into_inbound)
                .map_err(|err| ConnectionError::Read(err.to_string()))
        });
        let outcome = self
            .state
            .handler
            .run(self.credential.as_deref(), inbound, outbox)
            .await;

        if let Err(err) = writer.await {
            tracing::error!(error = %err, "WebSocket写任务异常退出");
        }
        tracing::debug!(?outcome, "WebSocket连接已结束");
    }
}

fn into_inbound(message: WsMessage) -> InboundFrame {
    match message {
        WsMessage::Text(text) => InboundFrame::Text(text.as_str().to_owned()),
        WsMessage::Binary(data) => InboundFrame::Binary(data.to_vec()),
        WsMessage::Ping(_) => InboundFrame::Ping,
        WsMessage::Pong(_) => InboundFrame::Pong,
        WsMessage::Close(_) => InboundFrame::Close,
    }
}

fn into_ws(frame: OutboundFrame) -> WsMessage {
    match frame {
        OutboundFrame::Text(text) => WsMessage::text(&*text),
    }
}

/// 写任务：出站队列 → socket。写失败时关闭连接，读循环随之退出。
async fn write_loop(mut sender: WsSender, mut outbound: OutboxReceiver, outbox: Outbox) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = write_frame(&mut sender, &outbound, into_ws(frame)).await {
            tracing::warn!(error = %err, "WebSocket写入失败");
            outbox.close();
            return;
        }
    }

    // 队列已关闭且清空，尽力发送关闭帧
    let close = WsMessage::Close(Some(CloseFrame {
        code: axum::extract::ws::close_code::NORMAL,
        reason: "".into(),
    }));
    let _ = tokio::time::timeout(CLOSE_GRACE, sender.send(close)).await;
    let _ = tokio::time::timeout(CLOSE_GRACE, sender.close()).await;
}

async fn write_frame(
    sender: &mut WsSender,
    outbound: &OutboxReceiver,
    message: WsMessage,
) -> Result<(), ConnectionError> {
    let send = sender.send(message);
    tokio::pin!(send);

    if !outbound.is_closed() {
        tokio::select! {
            biased;
            result = &mut send => {
                return result.map_err(|err| ConnectionError::Write(err.to_string()));
            }
            _ = outbound.closed() => {}
        }
    }

    // 连接已关闭：卡住的写入只再等一小段时间
    match tokio::time::timeout(CLOSE_GRACE, &mut send).await {
        Ok(result) => result.map_err(|err| ConnectionError::Write(err.to_string())),
        Err(_) => Err(ConnectionError::Write("write timed out after close".to_string())),
    }
}
