//! 거래소 시세 스트림 어댑터.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - TickerAdapter trait: 거래소 중립 연결/구독/디코딩 인터페이스
//! - Binance 커넥터 (다중화된 JSON 스트림)
//! - Huobi 커넥터 (gzip 압축 프레임, ping/pong 응답 필요)
//! - 재연결 백오프 정책

pub mod connector;
pub mod error;
pub mod retry;
pub mod traits;

pub use connector::{BinanceAdapter, HuobiAdapter};
pub use error::*;
pub use retry::ReconnectPolicy;
pub use traits::*;
