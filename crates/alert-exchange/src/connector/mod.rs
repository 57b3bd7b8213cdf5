//! 거래소 커넥터 모듈.

pub mod binance;
pub mod huobi;

pub use binance::BinanceAdapter;
pub use huobi::HuobiAdapter;

use crate::error::{ExchangeError, ExchangeResult};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// 읽기/제어/종료 태스크가 공유하는 WebSocket 쓰기 쪽.
pub(crate) struct WsSink {
    inner: Mutex<SplitSink<WsStream, Message>>,
    closed: AtomicBool,
}

impl WsSink {
    fn new(sink: SplitSink<WsStream, Message>) -> Self {
        Self {
            inner: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) async fn send(&self, msg: Message) -> ExchangeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExchangeError::Disconnected("connection closed".to_string()));
        }
        let mut sink = self.inner.lock().await;
        sink.send(msg).await.map_err(ExchangeError::from)
    }

    pub(crate) async fn send_json<T: Serialize>(&self, payload: &T) -> ExchangeResult<()> {
        let json = serde_json::to_string(payload)?;
        debug!(frame = %json, "WebSocket 프레임 전송");
        self.send(Message::Text(json)).await
    }

    /// Close 프레임을 보내고 쓰기 쪽을 닫습니다. 최초 호출만 효과가 있습니다.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut sink = self.inner.lock().await;
        if let Err(e) = sink.close().await {
            debug!("WebSocket close 실패 (무시): {}", e);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// WebSocket에 연결하고 읽기/쓰기 쪽으로 분리합니다.
pub(crate) async fn connect_ws(url: &str, timeout: Duration) -> ExchangeResult<(WsSink, WsSource)> {
    info!("WebSocket 연결 중: {}", url);

    let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| ExchangeError::Timeout(format!("connect {url}")))?
        .map_err(|e| ExchangeError::WebSocket(e.to_string()))?;

    let (write, read) = ws_stream.split();
    Ok((WsSink::new(write), read))
}
