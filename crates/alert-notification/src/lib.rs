//! # Alert Notification
//!
//! 가격 알림 전송 서비스.
//!
//! 지원 채널:
//! - Telegram (Bot API `sendMessage`, HTML 파싱 모드)

pub mod telegram;
pub mod types;

pub use telegram::*;
pub use types::*;
