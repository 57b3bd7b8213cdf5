//! # Alert Core
//!
//! 가격 알림 엔진의 핵심 도메인 타입을 제공합니다.
//!
//! 이 크레이트는 엔진 전반에서 사용되는 기본 타입을 제공합니다:
//! - 거래소(Market) 및 알림(Alert) 정의
//! - 정렬 가능한 알림 키(AlertKey)
//! - 알림 생성/삭제 요청 타입
//! - 설정 관리
//! - 로깅 인프라

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;

pub use config::*;
pub use domain::*;
pub use error::*;
pub use logging::*;
