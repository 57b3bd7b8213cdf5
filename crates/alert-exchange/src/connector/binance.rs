//! Binance 시세 스트림 커넥터.
//!
//! 사용자/거래소당 연결 하나에 여러 페어를 `<pair>@ticker` 스트림으로 다중화합니다.
//! 구독 변경은 `SUBSCRIBE`/`UNSUBSCRIBE` 제어 프레임으로 전송합니다.

use super::{connect_ws, WsSink, WsSource};
use crate::error::{ExchangeError, ExchangeResult};
use crate::traits::{Tick, TickerAdapter, TickerConnection, TickerReader, TickerWriter};
use alert_core::{ExchangeEndpoint, Market};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

/// Binance WebSocket 구독 메시지.
#[derive(Debug, Serialize)]
struct SubscribeMessage {
    method: &'static str,
    params: Vec<String>,
    id: u64,
}

/// Binance 24시간 티커 이벤트.
#[derive(Debug, Deserialize)]
struct WsTicker {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    close: String,
}

#[derive(Debug, Deserialize)]
struct WsErrorBody {
    code: i64,
    msg: String,
}

/// 수신 프레임 형태.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BinanceFrame {
    /// combined stream 래퍼 (`/stream` 엔드포인트)
    Combined {
        #[allow(dead_code)]
        stream: String,
        data: WsTicker,
    },
    /// 원시 이벤트 (`/ws` 엔드포인트)
    Raw(WsTicker),
    /// 제어 프레임 응답 (`{"result":null,"id":1}`)
    Ack {
        #[allow(dead_code)]
        result: serde_json::Value,
        id: u64,
    },
    /// 제어 프레임 에러
    Error { error: WsErrorBody },
    /// 그 외 (다른 이벤트 종류)
    Other(#[allow(dead_code)] serde_json::Value),
}

/// 티커 스트림 이름.
pub fn stream_name(pair: &str) -> String {
    format!("{}@ticker", pair.to_lowercase())
}

/// 텍스트 프레임 하나를 해석합니다.
///
/// 시세가 아닌 프레임(구독 응답 등)이면 `Ok(None)`을 반환합니다.
pub fn decode_frame(text: &str) -> ExchangeResult<Option<Tick>> {
    let ticker = match serde_json::from_str::<BinanceFrame>(text)? {
        BinanceFrame::Combined { data, .. } | BinanceFrame::Raw(data) => data,
        BinanceFrame::Ack { id, .. } => {
            debug!(id, "Binance 제어 프레임 응답");
            return Ok(None);
        }
        BinanceFrame::Error { error } => {
            return Err(ExchangeError::ApiError {
                code: error.code,
                message: error.msg,
            });
        }
        BinanceFrame::Other(_) => return Ok(None),
    };

    if ticker.event_type != "24hrTicker" {
        return Ok(None);
    }

    let price = ticker
        .close
        .parse::<f64>()
        .map_err(|e| ExchangeError::ParseError(format!("price '{}': {}", ticker.close, e)))?;

    Ok(Some(Tick::new(&ticker.symbol, price)))
}

/// Binance 어댑터.
pub struct BinanceAdapter {
    url: String,
    connect_timeout: Duration,
}

impl BinanceAdapter {
    pub fn new(endpoint: &ExchangeEndpoint) -> Self {
        Self {
            url: endpoint.ws_url.clone(),
            connect_timeout: endpoint.connect_timeout(),
        }
    }

    /// 임의 URL로 어댑터를 생성합니다.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl TickerAdapter for BinanceAdapter {
    fn market(&self) -> Market {
        Market::Binance
    }

    async fn connect(&self, pairs: &[String]) -> ExchangeResult<TickerConnection> {
        let (sink, source) = connect_ws(&self.url, self.connect_timeout).await?;
        let writer = Arc::new(BinanceWriter {
            sink: Arc::new(sink),
            message_id: AtomicU64::new(1),
        });

        if !pairs.is_empty() {
            let params = pairs.iter().map(|p| stream_name(p)).collect();
            if let Err(e) = writer.send_command("SUBSCRIBE", params).await {
                writer.sink.close().await;
                return Err(e);
            }
        }
        info!(pairs = pairs.len(), "Binance 스트림 연결됨");

        let reader = BinanceReader {
            source,
            sink: writer.sink.clone(),
        };

        Ok(TickerConnection {
            reader: Box::new(reader),
            writer,
        })
    }
}

struct BinanceWriter {
    sink: Arc<WsSink>,
    message_id: AtomicU64,
}

impl BinanceWriter {
    async fn send_command(&self, method: &'static str, params: Vec<String>) -> ExchangeResult<()> {
        let msg = SubscribeMessage {
            method,
            params,
            id: self.message_id.fetch_add(1, Ordering::Relaxed),
        };
        self.sink.send_json(&msg).await
    }
}

#[async_trait]
impl TickerWriter for BinanceWriter {
    async fn subscribe(&self, pair: &str) -> ExchangeResult<()> {
        self.send_command("SUBSCRIBE", vec![stream_name(pair)]).await
    }

    async fn unsubscribe(&self, pair: &str) -> ExchangeResult<()> {
        self.send_command("UNSUBSCRIBE", vec![stream_name(pair)]).await
    }

    async fn close(&self) {
        self.sink.close().await;
    }
}

struct BinanceReader {
    source: WsSource,
    sink: Arc<WsSink>,
}

#[async_trait]
impl TickerReader for BinanceReader {
    async fn next_tick(&mut self) -> ExchangeResult<Tick> {
        loop {
            let msg = match self.source.next().await {
                Some(msg) => msg?,
                None => return Err(ExchangeError::Disconnected("stream ended".to_string())),
            };

            match msg {
                Message::Text(text) => {
                    if let Some(tick) = decode_frame(&text)? {
                        return Ok(tick);
                    }
                }
                Message::Ping(data) => {
                    if !self.sink.is_closed() {
                        self.sink.send(Message::Pong(data)).await?;
                    }
                }
                Message::Close(frame) => {
                    warn!("Binance 연결 종료 프레임 수신: {:?}", frame);
                    return Err(ExchangeError::Disconnected(format!("close frame: {frame:?}")));
                }
                _ => {}
            }
        }
    }
}
