//! 단일 슬롯 신호함.
//!
//! 용량 1짜리 채널처럼 동작하지만 큐가 쌓이지 않습니다. 같은 종류의 신호가
//! 연달아 오면 하나로 합쳐집니다.
//! - [`SlotMode::Replace`]: 최신 값만 남깁니다 (구독/구독 해제 신호).
//! - [`SlotMode::KeepFirst`]: 대기 중인 값이 있으면 새 값을 버립니다 (종료 신호).

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// 슬롯이 이미 차 있을 때의 동작.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMode {
    Replace,
    KeepFirst,
}

/// 소비자 하나를 위한 단일 슬롯 신호함.
#[derive(Debug)]
pub struct SignalSlot<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
    mode: SlotMode,
}

impl<T> SignalSlot<T> {
    pub fn new(mode: SlotMode) -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
            mode,
        }
    }

    /// 최신 값만 유지하는 신호함.
    pub fn coalescing() -> Self {
        Self::new(SlotMode::Replace)
    }

    /// 첫 값만 유지하는 신호함.
    pub fn latched() -> Self {
        Self::new(SlotMode::KeepFirst)
    }

    fn slot(&self) -> MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 신호를 보냅니다. 블로킹하지 않습니다.
    ///
    /// `KeepFirst` 모드에서 이미 대기 중인 신호가 있으면 `false`를 반환합니다.
    pub fn send(&self, value: T) -> bool {
        {
            let mut slot = self.slot();
            if slot.is_some() && self.mode == SlotMode::KeepFirst {
                return false;
            }
            *slot = Some(value);
        }
        self.notify.notify_one();
        true
    }

    /// 대기 중인 신호를 꺼냅니다.
    pub fn try_take(&self) -> Option<T> {
        self.slot().take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot().is_some()
    }

    /// 신호가 올 때까지 기다립니다.
    ///
    /// `select!` 안에서 취소되어도 신호는 슬롯에 남습니다.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(value) = self.try_take() {
                return value;
            }
            self.notify.notified().await;
        }
    }
}
