//! Huobi 시세 스트림 커넥터.
//!
//! - 페어마다 `{"sub":"market.<pair>.ticker","id":"<pair>"}` 프레임으로 구독합니다.
//! - 서버가 보내는 모든 프레임은 gzip 압축되어 있습니다.
//! - 서버의 `{"ping":ts}`에는 같은 연결로 즉시 `{"pong":ts}`를 보내야 합니다.
//!   응답하지 않으면 서버가 연결을 끊습니다.

use super::{connect_ws, WsSink, WsSource};
use crate::error::{ExchangeError, ExchangeResult};
use crate::traits::{Tick, TickerAdapter, TickerConnection, TickerReader, TickerWriter};
use alert_core::{ExchangeEndpoint, Market};
use async_trait::async_trait;
use flate2::bufread::GzDecoder;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
struct SubRequest {
    sub: String,
    id: String,
}

#[derive(Debug, Serialize)]
struct UnsubRequest {
    unsub: String,
    id: String,
}

#[derive(Debug, Serialize)]
struct Pong {
    pong: i64,
}

#[derive(Debug, Deserialize)]
struct HuobiTick {
    #[serde(rename = "lastPrice")]
    last_price: Option<f64>,
    close: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HuobiFrame {
    Ping {
        ping: i64,
    },
    Tick {
        ch: String,
        tick: HuobiTick,
    },
    Status {
        status: String,
        #[serde(rename = "err-code", default)]
        err_code: Option<String>,
        #[serde(rename = "err-msg", default)]
        err_msg: Option<String>,
    },
    Other(#[allow(dead_code)] serde_json::Value),
}

/// 해석된 Huobi 프레임.
#[derive(Debug, Clone, PartialEq)]
pub enum HuobiEvent {
    /// 서버 heartbeat. 같은 값으로 pong을 보내야 합니다.
    Ping(i64),
    Tick(Tick),
    /// 구독 응답 등 처리할 필요가 없는 프레임
    Ignored,
}

/// 티커 채널 이름.
pub fn channel_name(pair: &str) -> String {
    format!("market.{}.ticker", pair.to_lowercase())
}

/// 채널 이름(`market.<pair>.ticker`)에서 심볼을 추출합니다.
fn symbol_from_channel(ch: &str) -> Option<&str> {
    let mut parts = ch.split('.');
    match (parts.next(), parts.next()) {
        (Some("market"), Some(symbol)) if !symbol.is_empty() => Some(symbol),
        _ => None,
    }
}

/// 압축 해제된 JSON 프레임을 해석합니다.
pub fn decode_json(text: &str) -> ExchangeResult<HuobiEvent> {
    match serde_json::from_str::<HuobiFrame>(text)? {
        HuobiFrame::Ping { ping } => Ok(HuobiEvent::Ping(ping)),
        HuobiFrame::Tick { ch, tick } => {
            let symbol = symbol_from_channel(&ch)
                .ok_or_else(|| ExchangeError::ParseError(format!("channel '{ch}'")))?;
            let price = tick
                .last_price
                .or(tick.close)
                .ok_or_else(|| ExchangeError::ParseError(format!("no price in {ch}")))?;
            Ok(HuobiEvent::Tick(Tick::new(symbol, price)))
        }
        HuobiFrame::Status {
            status,
            err_code,
            err_msg,
        } => {
            if status == "ok" {
                Ok(HuobiEvent::Ignored)
            } else {
                Err(ExchangeError::ApiError {
                    code: -1,
                    message: format!(
                        "{}: {}",
                        err_code.unwrap_or_default(),
                        err_msg.unwrap_or_default()
                    ),
                })
            }
        }
        HuobiFrame::Other(_) => Ok(HuobiEvent::Ignored),
    }
}

/// 프레임마다 재사용되는 gzip 압축 해제기.
///
/// 헤더 해석과 CRC32/ISIZE 트레일러 검증은 `GzDecoder`가 합니다.
pub struct FrameDecoder {
    inflater: GzDecoder<Cursor<Vec<u8>>>,
    text: String,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            inflater: GzDecoder::new(Cursor::new(Vec::new())),
            text: String::with_capacity(1024),
        }
    }

    /// gzip 프레임 하나를 압축 해제합니다. 반환값은 다음 호출 전까지 유효합니다.
    pub fn decompress(&mut self, frame: Vec<u8>) -> ExchangeResult<&str> {
        // 이전 프레임의 헤더/inflate/CRC 상태를 버리고 새 입력으로 교체
        self.inflater.reset(Cursor::new(frame));
        self.text.clear();
        self.inflater
            .read_to_string(&mut self.text)
            .map_err(|e| ExchangeError::ParseError(format!("gzip: {e}")))?;

        Ok(&self.text)
    }

    /// 프레임을 압축 해제하고 해석합니다.
    pub fn decode(&mut self, frame: Vec<u8>) -> ExchangeResult<HuobiEvent> {
        let text = self.decompress(frame)?;
        decode_json(text)
    }
}

/// Huobi 어댑터.
pub struct HuobiAdapter {
    url: String,
    connect_timeout: Duration,
}

impl HuobiAdapter {
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
impl TickerAdapter for HuobiAdapter {
    fn market(&self) -> Market {
        Market::Huobi
    }

    async fn connect(&self, pairs: &[String]) -> ExchangeResult<TickerConnection> {
        let (sink, source) = connect_ws(&self.url, self.connect_timeout).await?;
        let writer = Arc::new(HuobiWriter {
            sink: Arc::new(sink),
        });

        for pair in pairs {
            if let Err(e) = writer.subscribe(pair).await {
                writer.sink.close().await;
                return Err(e);
            }
        }
        info!(pairs = pairs.len(), "Huobi 스트림 연결됨");

        let reader = HuobiReader {
            source,
            sink: writer.sink.clone(),
            decoder: FrameDecoder::new(),
        };

        Ok(TickerConnection {
            reader: Box::new(reader),
            writer,
        })
    }
}

struct HuobiWriter {
    sink: Arc<WsSink>,
}

#[async_trait]
impl TickerWriter for HuobiWriter {
    async fn subscribe(&self, pair: &str) -> ExchangeResult<()> {
        let req = SubRequest {
            sub: channel_name(pair),
            id: pair.to_lowercase(),
        };
        self.sink.send_json(&req).await
    }

    async fn unsubscribe(&self, pair: &str) -> ExchangeResult<()> {
        let req = UnsubRequest {
            unsub: channel_name(pair),
            id: pair.to_lowercase(),
        };
        self.sink.send_json(&req).await
    }

    async fn close(&self) {
        self.sink.close().await;
    }
}

struct HuobiReader {
    source: WsSource,
    sink: Arc<WsSink>,
    decoder: FrameDecoder,
}

impl HuobiReader {
    async fn handle(&mut self, event: HuobiEvent) -> ExchangeResult<Option<Tick>> {
        match event {
            HuobiEvent::Ping(ts) => {
                debug!(ts, "Huobi ping 수신, pong 응답");
                self.sink.send_json(&Pong { pong: ts }).await?;
                Ok(None)
            }
            HuobiEvent::Tick(tick) => Ok(Some(tick)),
            HuobiEvent::Ignored => Ok(None),
        }
    }
}

#[async_trait]
impl TickerReader for HuobiReader {
    async fn next_tick(&mut self) -> ExchangeResult<Tick> {
        loop {
            let msg = match self.source.next().await {
                Some(msg) => msg?,
                None => return Err(ExchangeError::Disconnected("stream ended".to_string())),
            };

            let event = match msg {
                Message::Binary(frame) => self.decoder.decode(frame)?,
                Message::Text(text) => decode_json(&text)?,
                Message::Close(frame) => {
                    warn!("Huobi 연결 종료 프레임 수신: {:?}", frame);
                    return Err(ExchangeError::Disconnected(format!("close frame: {frame:?}")));
                }
                _ => continue,
            };

            if let Some(tick) = self.handle(event).await? {
                return Ok(tick);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(text: &str) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(text.as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_decode_ping() {
        let mut decoder = FrameDecoder::new();
        let event = decoder.decode(gzip(r#"{"ping":1492420473027}"#)).unwrap();
        assert_eq!(event, HuobiEvent::Ping(1492420473027));
    }

    #[test]
    fn test_decode_tick() {
        let mut decoder = FrameDecoder::new();
        let frame = gzip(
            r#"{"ch":"market.btcusdt.ticker","ts":1630982370526,"tick":{"open":51732,"high":52785.64,"close":52735.63,"lastPrice":52735.63,"lastSize":0.001}}"#,
        );
        let event = decoder.decode(frame).unwrap();
        assert_eq!(event, HuobiEvent::Tick(Tick::new("btcusdt", 52735.63)));
    }

    #[test]
    fn test_decoder_is_reusable_across_frames() {
        let mut decoder = FrameDecoder::new();
        for i in 0..5 {
            let text = format!(r#"{{"ch":"market.ethusdt.ticker","tick":{{"lastPrice":{}.5}}}}"#, 3000 + i);
            match decoder.decode(gzip(&text)).unwrap() {
                HuobiEvent::Tick(tick) => assert_eq!(tick.last_price, 3000.5 + i as f64),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(
            decoder.decode(gzip(r#"{"ping":1}"#)).unwrap(),
            HuobiEvent::Ping(1)
        );
    }

    #[test]
    fn test_close_used_when_last_price_missing() {
        let event = decode_json(r#"{"ch":"market.btcusdt.ticker","tick":{"close":100.0}}"#).unwrap();
        assert_eq!(event, HuobiEvent::Tick(Tick::new("btcusdt", 100.0)));
    }

    #[test]
    fn test_sub_ack_ignored_and_error_reported() {
        let ack = r#"{"id":"btcusdt","status":"ok","subbed":"market.btcusdt.ticker","ts":1}"#;
        assert_eq!(decode_json(ack).unwrap(), HuobiEvent::Ignored);

        let err = r#"{"status":"error","err-code":"bad-request","err-msg":"invalid topic","ts":1}"#;
        assert!(matches!(
            decode_json(err),
            Err(ExchangeError::ApiError { .. })
        ));
    }

    #[test]
    fn test_bad_gzip_is_parse_error() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.decode(b"{\"ping\":1}".to_vec()).unwrap_err();
        assert!(matches!(err, ExchangeError::ParseError(_)));
    }

    #[test]
    fn test_corrupt_trailer_rejected() {
        let text = r#"{"ch":"market.btcusdt.ticker","tick":{"lastPrice":1.0}}"#;
        let mut decoder = FrameDecoder::new();

        let mut bad_crc = gzip(text);
        let len = bad_crc.len();
        for b in &mut bad_crc[len - 8..] {
            *b ^= 0xff;
        }
        assert!(matches!(
            decoder.decode(bad_crc),
            Err(ExchangeError::ParseError(_))
        ));

        let mut truncated = gzip(text);
        truncated.truncate(truncated.len() - 8);
        assert!(matches!(
            decoder.decode(truncated),
            Err(ExchangeError::ParseError(_))
        ));

        // 실패한 프레임 뒤에도 정상 프레임은 해석됨
        assert_eq!(
            decoder.decode(gzip(text)).unwrap(),
            HuobiEvent::Tick(Tick::new("btcusdt", 1.0))
        );
    }

    #[test]
    fn test_gzip_header_with_name() {
        let mut enc = flate2::GzBuilder::new()
            .filename("frame.json")
            .write(Vec::new(), Compression::fast());
        enc.write_all(br#"{"ping":42}"#).unwrap();
        let frame = enc.finish().unwrap();

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(frame).unwrap(), HuobiEvent::Ping(42));
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_name("BTCUSDT"), "market.btcusdt.ticker");
        assert_eq!(symbol_from_channel("market.btcusdt.ticker"), Some("btcusdt"));
        assert_eq!(symbol_from_channel("trade.btcusdt"), None);
    }
}
