//! 알림 엔진 핵심 에러 타입.

use thiserror::Error;

/// 도메인/설정 에러.
#[derive(Debug, Error)]
pub enum AlertError {
    /// 지원하지 않는 거래소
    #[error("지원하지 않는 거래소: {0}")]
    UnknownMarket(String),

    /// 잘못된 입력
    #[error("잘못된 입력: {0}")]
    InvalidInput(String),

    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 직렬화 에러
    #[error("직렬화 에러: {0}")]
    Serialization(String),
}

/// 도메인 작업을 위한 Result 타입.
pub type AlertResult<T> = Result<T, AlertError>;

impl From<serde_json::Error> for AlertError {
    fn from(err: serde_json::Error) -> Self {
        AlertError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for AlertError {
    fn from(err: config::ConfigError) -> Self {
        AlertError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AlertError::UnknownMarket("kraken".to_string());
        assert_eq!(err.to_string(), "지원하지 않는 거래소: kraken");
    }

    #[test]
    fn test_from_serde_error() {
        let err: AlertError = serde_json::from_str::<u32>("x").unwrap_err().into();
        assert!(matches!(err, AlertError::Serialization(_)));
    }
}
