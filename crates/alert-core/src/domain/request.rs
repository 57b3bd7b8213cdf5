//! 알림 생성/삭제 요청.
//!
//! 명령 파싱 계층에서 검증(페어 존재 여부, 양수 가격)을 마친 뒤 엔진으로 전달됩니다.

use crate::domain::alert::Alert;
use crate::domain::market::Market;
use crate::domain::{ChatId, UserId};
use crate::error::{AlertError, AlertResult};
use serde::{Deserialize, Serialize};

/// 알림 생성 요청.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRequest {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub market: Market,
    pub pair: String,
    pub price: f64,
}

impl AlertRequest {
    pub fn new(
        user_id: UserId,
        chat_id: ChatId,
        market: Market,
        pair: impl Into<String>,
        price: f64,
    ) -> Self {
        Self {
            user_id,
            chat_id,
            market,
            pair: pair.into(),
            price,
        }
    }

    /// 페어와 목표가의 기본 형식을 확인합니다.
    pub fn validate(&self) -> AlertResult<()> {
        if self.pair.trim().is_empty() {
            return Err(AlertError::InvalidInput("pair is empty".to_string()));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(AlertError::InvalidInput(format!(
                "target price must be positive: {}",
                self.price
            )));
        }
        Ok(())
    }

    /// 요청으로부터 새 알림을 만듭니다.
    pub fn to_alert(&self) -> Alert {
        Alert::new(self.market, &self.pair, self.price)
    }
}

/// 삭제 대상.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalTarget {
    /// 특정 페어 하나
    Pair(String),
    /// 사용자의 모든 알림 (모든 거래소)
    All,
}

impl RemovalTarget {
    /// 명령 인자를 해석합니다. `"all"`은 전체 삭제를 의미합니다.
    pub fn parse(arg: &str) -> Self {
        if arg.eq_ignore_ascii_case("all") {
            RemovalTarget::All
        } else {
            RemovalTarget::Pair(arg.to_lowercase())
        }
    }
}

/// 알림 삭제 요청.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRemoval {
    pub user_id: UserId,
    pub market: Market,
    pub target: RemovalTarget,
}

impl AlertRemoval {
    pub fn pair(user_id: UserId, market: Market, pair: impl AsRef<str>) -> Self {
        Self {
            user_id,
            market,
            target: RemovalTarget::Pair(pair.as_ref().to_lowercase()),
        }
    }

    pub fn all(user_id: UserId, market: Market) -> Self {
        Self {
            user_id,
            market,
            target: RemovalTarget::All,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removal_target_parse() {
        assert_eq!(RemovalTarget::parse("ALL"), RemovalTarget::All);
        assert_eq!(
            RemovalTarget::parse("BTCUSDT"),
            RemovalTarget::Pair("btcusdt".to_string())
        );
    }

    #[test]
    fn test_request_validate() {
        assert!(AlertRequest::new(1, 1, Market::Huobi, "btcusdt", 1.0)
            .validate()
            .is_ok());
        assert!(AlertRequest::new(1, 1, Market::Huobi, " ", 1.0)
            .validate()
            .is_err());
        assert!(AlertRequest::new(1, 1, Market::Huobi, "btcusdt", -5.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_request_to_alert() {
        let req = AlertRequest::new(1, 10, Market::Binance, "BTCUSDT", 50_000.0);
        let alert = req.to_alert();
        assert_eq!(alert.pair, "btcusdt");
        assert_eq!(alert.target_price, 50_000.0);
    }
}
