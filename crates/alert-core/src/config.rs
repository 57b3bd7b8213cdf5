//! 설정 관리.
//!
//! TOML 파일과 `ALERT__` 접두사 환경 변수에서 애플리케이션 설정을 읽습니다.
//! 모든 항목은 기본값이 있으므로 설정 파일이 없어도 동작합니다.
//!
//! ```toml
//! [stream]
//! max_reconnect_attempts = 20
//!
//! [exchanges.huobi]
//! ws_url = "wss://api-aws.huobi.pro/ws"
//! ```

use crate::domain::{Market, SignalPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 애플리케이션 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// 로깅 설정
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 거래소 설정
    #[serde(default)]
    pub exchanges: ExchangesConfig,
    /// 스트림 감시 설정
    #[serde(default)]
    pub stream: StreamConfig,
    /// 알림 설정
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 로그 레벨
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// 거래소별 WebSocket 엔드포인트.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangesConfig {
    #[serde(default = "default_binance")]
    pub binance: ExchangeEndpoint,
    #[serde(default = "default_huobi")]
    pub huobi: ExchangeEndpoint,
}

impl Default for ExchangesConfig {
    fn default() -> Self {
        Self {
            binance: default_binance(),
            huobi: default_huobi(),
        }
    }
}

impl ExchangesConfig {
    /// 거래소의 엔드포인트 설정.
    pub fn endpoint(&self, market: Market) -> &ExchangeEndpoint {
        match market {
            Market::Binance => &self.binance,
            Market::Huobi => &self.huobi,
        }
    }
}

/// 단일 거래소 엔드포인트.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeEndpoint {
    /// WebSocket URL
    pub ws_url: String,
    /// 연결 타임아웃 (초)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl ExchangeEndpoint {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_binance() -> ExchangeEndpoint {
    ExchangeEndpoint {
        ws_url: "wss://stream.binance.com:9443/stream".to_string(),
        connect_timeout_secs: default_connect_timeout(),
    }
}

fn default_huobi() -> ExchangeEndpoint {
    ExchangeEndpoint {
        ws_url: "wss://api.huobi.pro/ws".to_string(),
        connect_timeout_secs: default_connect_timeout(),
    }
}

fn default_connect_timeout() -> u64 {
    10
}

/// 스트림 감시/재연결 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    /// 재연결 기본 대기 시간 (밀리초)
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_delay_ms: u64,
    /// 재연결 최대 대기 시간 (밀리초)
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_delay_ms: u64,
    /// 연속 재연결 최대 시도 횟수
    #[serde(default = "default_max_reconnect")]
    pub max_reconnect_attempts: u32,
    /// 목표가 허용 범위 (%)
    #[serde(default = "default_band_pct")]
    pub band_pct: f64,
    /// 알림 재발송 간격 (초)
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// 종료 시 작업 대기 시간 (초)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_reconnect_base() -> u64 {
    1000
}
fn default_reconnect_max() -> u64 {
    60_000
}
fn default_max_reconnect() -> u32 {
    10
}
fn default_band_pct() -> f64 {
    1.0
}
fn default_cooldown() -> u64 {
    15 * 60
}
fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: default_reconnect_base(),
            reconnect_max_delay_ms: default_reconnect_max(),
            max_reconnect_attempts: default_max_reconnect(),
            band_pct: default_band_pct(),
            cooldown_secs: default_cooldown(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl StreamConfig {
    /// 알림 발송 조건.
    pub fn signal_policy(&self) -> SignalPolicy {
        SignalPolicy {
            band_pct: self.band_pct,
            cooldown: chrono::Duration::seconds(self.cooldown_secs as i64),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// 알림 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub telegram: TelegramSection,
}

/// 텔레그램 봇 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramSection {
    /// 활성화 여부
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 봇 토큰 (비어 있으면 `TELEGRAM_BOT_TOKEN` 사용)
    #[serde(default)]
    pub bot_token: String,
    /// Bot API 기본 URL
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// 전송 요청 타임아웃 (초)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl TelegramSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            enabled: true,
            bot_token: String::new(),
            api_base: default_api_base(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl AppConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    ///
    /// 파일이 없으면 기본값과 환경 변수만 사용합니다.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("ALERT")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 기본 경로에서 설정을 로드합니다.
    pub fn load_default() -> Result<Self, config::ConfigError> {
        Self::load("config/default.toml")
    }
}
