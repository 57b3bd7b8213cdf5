//! # Alert Engine
//!
//! 사용자별 거래소 시세 스트림을 관리하고 목표가 도달 시 알림을 보냅니다.
//!
//! 구성 요소:
//! - [`AlertStore`]: 알림 영속 저장소 계약과 메모리 구현
//! - [`Session`]: 사용자별 정렬된 알림 인덱스 (실행 중 기준 상태)
//! - [`ChannelRegistry`]: (사용자, 거래소)별 제어 신호
//! - 스트림 감시자: 연결, 시세 처리, 구독 변경, 재연결
//! - [`AlertEngine`]: 생성/삭제/복구/종료 진입점

pub mod channels;
pub mod engine;
pub mod error;
pub mod session;
pub mod signal;
pub mod store;
mod supervisor;

pub use channels::{ChannelRegistry, MarketChannels, SharedRegistry, StreamState};
pub use engine::{AlertEngine, CreateOutcome, EngineConfig, RecoveryReport, RemoveOutcome};
pub use error::{EngineError, EngineResult};
pub use session::{Session, SharedSession};
pub use signal::{SignalSlot, SlotMode};
pub use store::{AlertStore, InMemoryAlertStore, StoreError, StoreResult, StoredUser};
