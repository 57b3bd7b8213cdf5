//! 거래소 시세 스트림 trait.
//!
//! 연결 하나는 읽기 쪽([`TickerReader`])과 쓰기 쪽([`TickerWriter`])으로 나뉩니다.
//! 읽기 루프가 reader를 단독 소유하고, 제어 루프와 종료 태스크가 writer를 공유합니다.

use crate::error::ExchangeResult;
use alert_core::Market;
use async_trait::async_trait;
use std::sync::Arc;

/// 디코딩된 시세.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// 소문자 심볼 (예: "btcusdt")
    pub symbol: String,
    /// 최근 체결가
    pub last_price: f64,
}

impl Tick {
    pub fn new(symbol: impl AsRef<str>, last_price: f64) -> Self {
        Self {
            symbol: symbol.as_ref().to_lowercase(),
            last_price,
        }
    }
}

/// 연결의 읽기 쪽.
#[async_trait]
pub trait TickerReader: Send {
    /// 다음 시세를 읽습니다.
    ///
    /// 구독 응답, ping 등 시세가 아닌 프레임은 내부에서 처리하고 건너뜁니다.
    /// 연결이 끊기거나 프레임을 해석할 수 없으면 에러를 반환합니다.
    async fn next_tick(&mut self) -> ExchangeResult<Tick>;
}

/// 연결의 쓰기 쪽.
#[async_trait]
pub trait TickerWriter: Send + Sync {
    /// 페어 구독 프레임을 전송합니다.
    async fn subscribe(&self, pair: &str) -> ExchangeResult<()>;

    /// 페어 구독 해제 프레임을 전송합니다.
    async fn unsubscribe(&self, pair: &str) -> ExchangeResult<()>;

    /// 연결을 닫습니다. 여러 번 호출해도 한 번만 닫힙니다.
    async fn close(&self);
}

/// 연결된 스트림.
pub struct TickerConnection {
    pub reader: Box<dyn TickerReader>,
    pub writer: Arc<dyn TickerWriter>,
}

/// 거래소 어댑터.
#[async_trait]
pub trait TickerAdapter: Send + Sync {
    /// 어댑터가 담당하는 거래소.
    fn market(&self) -> Market;

    /// 연결 후 초기 페어를 모두 구독합니다.
    async fn connect(&self, pairs: &[String]) -> ExchangeResult<TickerConnection>;
}
