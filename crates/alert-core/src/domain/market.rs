//! 지원 거래소 정의.

use crate::error::AlertError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 시세 스트림을 제공하는 거래소.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    /// Binance (다중화된 JSON 스트림)
    Binance,
    /// Huobi (gzip 압축 + ping/pong 스트림)
    Huobi,
}

impl Market {
    /// 지원하는 모든 거래소.
    pub const ALL: [Market; 2] = [Market::Binance, Market::Huobi];

    /// 소문자 문자열 표현.
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Binance => "binance",
            Market::Huobi => "huobi",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Market {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Ok(Market::Binance),
            "huobi" => Ok(Market::Huobi),
            other => Err(AlertError::UnknownMarket(other.to_string())),
        }
    }
}
