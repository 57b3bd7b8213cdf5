//! 도메인 모델.

pub mod alert;
pub mod market;
pub mod request;

pub use alert::*;
pub use market::*;
pub use request::*;

/// 채팅 플랫폼의 사용자 ID.
pub type UserId = i64;

/// 알림 메시지를 보낼 채팅 ID.
pub type ChatId = i64;
