//! 텔레그램 알림 서비스.
//!
//! Telegram Bot API를 통해 가격 알림과 구독 확인 메시지를 전송합니다.

use crate::types::{NotificationError, NotificationResult, NotificationSink};
use alert_core::{ChatId, TelegramSection};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, warn};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// 텔레그램 전송 설정.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// @BotFather에서 받은 봇 토큰
    pub bot_token: String,
    /// Bot API 기본 URL
    pub api_base: String,
    /// 전송 활성화 여부
    pub enabled: bool,
    /// 파싱 모드 (HTML 또는 MarkdownV2)
    pub parse_mode: String,
    /// 요청 하나의 최대 대기 시간
    pub request_timeout: Duration,
}

impl TelegramConfig {
    /// 새 텔레그램 설정을 생성합니다.
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            enabled: true,
            parse_mode: "HTML".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bot API 기본 URL을 변경합니다.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// 설정 파일 섹션에서 생성합니다. 토큰이 비어 있으면 `TELEGRAM_BOT_TOKEN`을 사용합니다.
    pub fn from_section(section: &TelegramSection) -> NotificationResult<Self> {
        let bot_token = if section.bot_token.is_empty() {
            std::env::var("TELEGRAM_BOT_TOKEN").map_err(|_| {
                NotificationError::InvalidConfig("telegram bot token is not set".to_string())
            })?
        } else {
            section.bot_token.clone()
        };

        Ok(Self {
            enabled: section.enabled,
            api_base: section.api_base.clone(),
            request_timeout: section.request_timeout(),
            ..Self::new(bot_token)
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    description: String,
    parameters: Option<ErrorParameters>,
}

/// 목표가 도달 알림 본문.
pub fn format_alert(symbol: &str, price: f64) -> String {
    format!("🚨 <b>{}</b> - <b>{:.2}</b>", symbol.to_uppercase(), price)
}

/// 구독 확인 본문.
pub fn format_subscription_confirmed() -> String {
    "<b>Alert has been set</b>".to_string()
}

/// 텔레그램 알림 전송기.
pub struct TelegramSink {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramSink {
    /// 요청 타임아웃이 설정된 HTTP 클라이언트로 전송기를 만듭니다.
    pub fn new(config: TelegramConfig) -> NotificationResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.bot_token.is_empty()
    }

    /// 텔레그램에 원시 메시지를 전송합니다.
    async fn send_message(&self, chat_id: ChatId, text: &str, silent: bool) -> NotificationResult<()> {
        if !self.is_enabled() {
            debug!("Telegram notifications are disabled, skipping");
            return Ok(());
        }

        let url = format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        );

        let params = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": self.config.parse_mode,
            "disable_notification": silent,
            "disable_web_page_preview": true,
        });

        debug!(chat_id, "Sending Telegram message");

        let response = self.client.post(&url).json(&params).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<ErrorBody>(&body).ok();

        if status.as_u16() == 429 {
            let retry_after = parsed
                .as_ref()
                .and_then(|b| b.parameters.as_ref())
                .and_then(|p| p.retry_after)
                .unwrap_or(60);
            warn!(chat_id, retry_after, "Telegram rate limited");
            return Err(NotificationError::RateLimited(retry_after));
        }

        let description = parsed.map(|b| b.description).unwrap_or(body);
        error!("Failed to send Telegram message: {} - {}", status, description);
        Err(NotificationError::SendFailed(format!(
            "HTTP {}: {}",
            status, description
        )))
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn send_alert(&self, chat_id: ChatId, symbol: &str, price: f64) -> NotificationResult<()> {
        self.send_message(chat_id, &format_alert(symbol, price), true)
            .await
    }

    async fn send_subscription_confirmed(&self, chat_id: ChatId) -> NotificationResult<()> {
        self.send_message(chat_id, &format_subscription_confirmed(), false)
            .await
    }

    fn name(&self) -> &str {
        "telegram"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn sink_for(server: &mockito::ServerGuard) -> TelegramSink {
        TelegramSink::new(TelegramConfig::new("TEST").with_api_base(server.url())).unwrap()
    }

    #[test]
    fn test_format_alert() {
        assert_eq!(
            format_alert("btcusdt", 50100.0),
            "🚨 <b>BTCUSDT</b> - <b>50100.00</b>"
        );
        assert_eq!(format_alert("ethusdt", 0.12345), "🚨 <b>ETHUSDT</b> - <b>0.12</b>");
    }

    #[tokio::test]
    async fn test_send_alert_is_silent_html() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTEST/sendMessage")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "chat_id": 42,
                "text": "🚨 <b>BTCUSDT</b> - <b>50100.00</b>",
                "parse_mode": "HTML",
                "disable_notification": true,
            })))
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{}}"#)
            .create_async()
            .await;

        sink_for(&server).send_alert(42, "btcusdt", 50_100.0).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_confirmation() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTEST/sendMessage")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "chat_id": 7,
                "text": "<b>Alert has been set</b>",
                "disable_notification": false,
            })))
            .with_status(200)
            .create_async()
            .await;

        sink_for(&server).send_subscription_confirmed(7).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/botTEST/sendMessage")
            .with_status(429)
            .with_body(r#"{"ok":false,"error_code":429,"description":"Too Many Requests","parameters":{"retry_after":17}}"#)
            .create_async()
            .await;

        let err = sink_for(&server).send_alert(1, "btcusdt", 1.0).await.unwrap_err();
        assert!(matches!(err, NotificationError::RateLimited(17)));
    }

    #[tokio::test]
    async fn test_send_failed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/botTEST/sendMessage")
            .with_status(400)
            .with_body(r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#)
            .create_async()
            .await;

        let err = sink_for(&server).send_alert(1, "btcusdt", 1.0).await.unwrap_err();
        match err {
            NotificationError::SendFailed(msg) => assert!(msg.contains("chat not found")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_disabled_sink_skips_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let mut config = TelegramConfig::new("TEST").with_api_base(server.url());
        config.enabled = false;
        TelegramSink::new(config)
            .unwrap()
            .send_alert(1, "btcusdt", 1.0)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn test_from_section_with_token() {
        let section = TelegramSection {
            enabled: true,
            bot_token: "abc".to_string(),
            api_base: "http://localhost:1".to_string(),
            request_timeout_secs: 3,
        };
        let config = TelegramConfig::from_section(&section).unwrap();
        assert_eq!(config.bot_token, "abc");
        assert_eq!(config.api_base, "http://localhost:1");
        assert_eq!(config.parse_mode, "HTML");
        assert_eq!(config.request_timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_unresponsive_api_times_out() {
        // 연결은 받지만 응답하지 않는 서버
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let config = TelegramConfig::new("TEST")
            .with_api_base(format!("http://{addr}"))
            .with_timeout(Duration::from_millis(100));
        let sink = TelegramSink::new(config).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            sink.send_alert(1, "btcusdt", 1.0),
        )
        .await
        .expect("request should give up on its own");
        assert!(matches!(result, Err(NotificationError::NetworkError(_))));

        server.abort();
    }
}
