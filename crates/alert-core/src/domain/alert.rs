//! 가격 알림 및 알림 키 정의.
//!
//! 알림은 (거래소, 페어, 목표가)로 구성되며, 사용자별 알림 목록은 항상
//! [`AlertKey`] 기준으로 정렬된 상태로 유지되어 이진 탐색이 가능합니다.
//!
//! # 사용 예시
//!
//! ```rust
//! use alert_core::{Alert, Market, SignalPolicy};
//! use chrono::Utc;
//!
//! let alert = Alert::new(Market::Binance, "BTCUSDT", 50_000.0);
//! assert_eq!(alert.pair, "btcusdt");
//! assert!(alert.should_signal(50_100.0, Utc::now(), &SignalPolicy::default()));
//! ```

use crate::domain::market::Market;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// (거래소, 페어)의 정렬 보존 인코딩.
///
/// `market + pair` 바이트의 소문자 hex 인코딩입니다. 바이트 하나가 항상 두 글자로
/// 인코딩되므로 키의 사전식 순서는 원본 문자열의 바이트 순서와 같습니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertKey(String);

impl AlertKey {
    /// 거래소와 페어로 키를 생성합니다. 페어는 소문자로 정규화됩니다.
    pub fn new(market: Market, pair: &str) -> Self {
        let raw = format!("{}{}", market.as_str(), pair.to_lowercase());
        Self(hex::encode(raw.as_bytes()))
    }

    /// hex 문자열.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 알림 발송 조건.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalPolicy {
    /// 목표가 대비 허용 범위 (%)
    pub band_pct: f64,
    /// 같은 알림의 재발송 최소 간격
    pub cooldown: Duration,
}

impl Default for SignalPolicy {
    fn default() -> Self {
        Self {
            band_pct: 1.0,
            cooldown: Duration::minutes(15),
        }
    }
}

/// 사용자의 가격 알림.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// 거래소
    pub market: Market,
    /// 소문자 심볼 (예: "btcusdt")
    pub pair: String,
    /// 목표가
    pub target_price: f64,
    /// 해당 거래소 스트림이 연결되어 있는지 여부
    #[serde(default)]
    pub connected: bool,
    /// 마지막 알림 발송 시각
    #[serde(default)]
    pub last_signal_at: Option<DateTime<Utc>>,
    /// 정렬/검색용 키
    pub key: AlertKey,
}

impl Alert {
    /// 새 알림을 생성합니다.
    pub fn new(market: Market, pair: impl AsRef<str>, target_price: f64) -> Self {
        let pair = pair.as_ref().to_lowercase();
        let key = AlertKey::new(market, &pair);
        Self {
            market,
            pair,
            target_price,
            connected: false,
            last_signal_at: None,
            key,
        }
    }

    /// 가격이 목표가 ± band_pct% 범위 안에 있는지 확인합니다 (경계 포함).
    pub fn in_band(&self, price: f64, band_pct: f64) -> bool {
        let delta = self.target_price * band_pct / 100.0;
        price >= self.target_price - delta && price <= self.target_price + delta
    }

    /// 마지막 발송 이후 쿨다운이 지났는지 확인합니다.
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.last_signal_at {
            None => true,
            Some(last) => now >= last + cooldown,
        }
    }

    /// 이 가격으로 알림을 보내야 하는지 판단합니다.
    pub fn should_signal(&self, price: f64, now: DateTime<Utc>, policy: &SignalPolicy) -> bool {
        self.in_band(price, policy.band_pct) && self.cooldown_elapsed(now, policy.cooldown)
    }
}

/// 알림 목록을 키 순서로 정렬합니다.
pub fn sort_by_key(alerts: &mut [Alert]) {
    alerts.sort_by(|a, b| a.key.cmp(&b.key));
}

/// 정렬된 알림 목록에서 키를 이진 탐색합니다.
pub fn find_by_key(alerts: &[Alert], key: &AlertKey) -> Option<usize> {
    alerts.binary_search_by(|a| a.key.cmp(key)).ok()
}

/// 구독/구독 해제 신호.
///
/// `remaining`은 신호를 보낸 시점에 해당 거래소에 남아있는 알림 수입니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairSignal {
    /// 대상 페어
    pub pair: String,
    /// 남은 알림 수
    pub remaining: i64,
}

impl PairSignal {
    pub fn new(pair: impl Into<String>, remaining: i64) -> Self {
        Self {
            pair: pair.into(),
            remaining,
        }
    }
}
