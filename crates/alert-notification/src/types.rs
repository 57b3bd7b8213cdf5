//! 알림 전송 trait 및 에러 정의.

use alert_core::ChatId;
use async_trait::async_trait;

pub type NotificationResult<T> = Result<T, NotificationError>;

/// 알림 에러.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("알림 전송 실패: {0}")]
    SendFailed(String),

    #[error("잘못된 설정: {0}")]
    InvalidConfig(String),

    #[error("요청 한도 초과: {0}초 후 재시도")]
    RateLimited(u64),

    #[error("네트워크 에러: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// 알림 전송 채널.
///
/// 엔진 입장에서는 보내고 잊는(fire-and-forget) 호출입니다. 실패는 로그로 남기고
/// 재시도하지 않습니다.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// 목표가 도달 알림을 전송합니다.
    async fn send_alert(&self, chat_id: ChatId, symbol: &str, price: f64)
        -> NotificationResult<()>;

    /// 구독 완료 확인 메시지를 전송합니다.
    async fn send_subscription_confirmed(&self, chat_id: ChatId) -> NotificationResult<()>;

    /// 로그용 채널 이름.
    fn name(&self) -> &str;
}
