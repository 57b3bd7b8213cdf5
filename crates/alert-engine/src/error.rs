//! 엔진 에러 타입.

use crate::store::StoreError;
use alert_core::{AlertError, Market};
use alert_exchange::ExchangeError;
use thiserror::Error;

/// 알림 생성/삭제 및 스트림 연결 에러.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("이미 등록된 알림: {market} {pair}")]
    AlertExists { market: Market, pair: String },

    #[error("알림을 찾을 수 없음: {market} {pair}")]
    AlertNotFound { market: Market, pair: String },

    /// 스트리밍할 페어가 없음. 에러가 아닌 종료 신호로 취급합니다.
    #[error("스트리밍할 페어 없음")]
    NoPairs,

    #[error("지원하지 않는 거래소: {0}")]
    UnsupportedMarket(Market),

    #[error("엔진 종료 중")]
    ShuttingDown,

    #[error("종료 대기 시간 초과: {0}초")]
    ShutdownTimeout(u64),

    #[error(transparent)]
    Invalid(#[from] AlertError),

    #[error(transparent)]
    Store(StoreError),

    #[error("거래소 연결 실패: {0}")]
    Exchange(#[from] ExchangeError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NoPairs => EngineError::NoPairs,
            StoreError::AlertExists { market, pair } => EngineError::AlertExists { market, pair },
            StoreError::AlertNotFound { market, pair } => {
                EngineError::AlertNotFound { market, pair }
            }
            other => EngineError::Store(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(
            EngineError::from(StoreError::NoPairs),
            EngineError::NoPairs
        ));
        assert!(matches!(
            EngineError::from(StoreError::Backend("down".into())),
            EngineError::Store(_)
        ));
        let err = EngineError::from(StoreError::AlertExists {
            market: Market::Binance,
            pair: "btcusdt".into(),
        });
        assert_eq!(err.to_string(), "이미 등록된 알림: binance btcusdt");
    }
}
