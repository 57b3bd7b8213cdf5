//! 사용자/거래소별 제어 신호 레지스트리.
//!
//! (사용자, 거래소)마다 [`MarketChannels`] 하나가 있고, 그 연결을 소유한 스트림
//! 감시자(supervisor)는 하나뿐입니다. 감시자는 항목을 직접 참조하지 않고
//! (user_id, market) 키로 매번 레지스트리에서 찾습니다.

use crate::signal::SignalSlot;
use alert_core::{Market, PairSignal, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

/// 스트림 감시자 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Disconnected = 0,
    Connecting = 1,
    Streaming = 2,
    Closing = 3,
    Reconnecting = 4,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamState::Connecting,
            2 => StreamState::Streaming,
            3 => StreamState::Closing,
            4 => StreamState::Reconnecting,
            _ => StreamState::Disconnected,
        }
    }
}

/// 거래소 하나의 제어 신호 묶음.
#[derive(Debug)]
pub struct MarketChannels {
    cancel: Mutex<Option<CancellationToken>>,
    shutdown: SignalSlot<()>,
    subscribe: SignalSlot<PairSignal>,
    unsubscribe: SignalSlot<PairSignal>,
    state: AtomicU8,
    claimed: AtomicBool,
    retired: AtomicBool,
    revision: AtomicU64,
    /// 구독 확인 메시지를 아직 보내지 않은 페어
    confirmations: Mutex<HashSet<String>>,
    lifecycle: AsyncMutex<()>,
}

impl Default for MarketChannels {
    fn default() -> Self {
        Self {
            cancel: Mutex::new(None),
            shutdown: SignalSlot::latched(),
            subscribe: SignalSlot::coalescing(),
            unsubscribe: SignalSlot::coalescing(),
            state: AtomicU8::new(StreamState::Disconnected as u8),
            claimed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            revision: AtomicU64::new(0),
            confirmations: Mutex::new(HashSet::new()),
            lifecycle: AsyncMutex::new(()),
        }
    }
}

impl MarketChannels {
    /// 현재 연결의 취소 토큰을 교체합니다.
    pub fn set_cancel(&self, token: CancellationToken) {
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    /// 현재 연결을 취소합니다.
    pub fn cancel(&self) {
        if let Some(token) = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
    }

    /// 종료 신호. 이미 대기 중이면 무시됩니다.
    pub fn shutdown(&self) -> bool {
        self.shutdown.send(())
    }

    /// 대기 중인 종료 신호를 꺼냅니다 (블로킹하지 않음).
    pub fn take_shutdown(&self) -> bool {
        self.shutdown.try_take().is_some()
    }

    pub fn subscribe_signal(&self, signal: PairSignal) {
        self.subscribe.send(signal);
    }

    pub fn unsubscribe_signal(&self, signal: PairSignal) {
        self.unsubscribe.send(signal);
    }

    pub(crate) async fn recv_subscribe(&self) -> PairSignal {
        self.subscribe.recv().await
    }

    pub(crate) async fn recv_unsubscribe(&self) -> PairSignal {
        self.unsubscribe.recv().await
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// 감시자 소유권을 획득합니다. 이미 소유자가 있으면 `false`.
    pub(crate) fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// 항목을 폐기 상태로 만듭니다. 이후 이 항목으로는 스트림을 시작하지 않습니다.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.claimed.store(false, Ordering::Release);
        self.set_state(StreamState::Disconnected);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// 세션의 알림 목록이 바뀌었음을 알립니다.
    pub(crate) fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// 연결에 구독되면 확인 메시지를 보낼 페어를 기록합니다.
    pub(crate) fn defer_confirmation(&self, pair: &str) {
        self.confirmations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pair.to_string());
    }

    /// 기록된 확인 대기 페어를 꺼냅니다. 없었으면 `false`.
    pub(crate) fn take_confirmation(&self, pair: &str) -> bool {
        self.confirmations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pair)
    }

    pub(crate) fn clear_confirmations(&self) {
        self.confirmations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// 생성/삭제/폐기 결정을 직렬화하는 락.
    pub(crate) async fn lock_lifecycle(&self) -> AsyncMutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }
}

/// 사용자 한 명의 거래소별 신호 묶음.
#[derive(Debug, Clone, Default)]
pub struct UserChannels {
    markets: HashMap<Market, Arc<MarketChannels>>,
}

impl UserChannels {
    pub fn market(&self, market: Market) -> Option<&Arc<MarketChannels>> {
        self.markets.get(&market)
    }

    pub fn markets(&self) -> impl Iterator<Item = Market> + '_ {
        self.markets.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}

/// 프로세스 전역 신호 레지스트리.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    users: RwLock<HashMap<UserId, UserChannels>>,
}

pub type SharedRegistry = Arc<ChannelRegistry>;

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 사용자의 신호 묶음 사본.
    pub async fn get(&self, user_id: UserId) -> Option<UserChannels> {
        self.users.read().await.get(&user_id).cloned()
    }

    pub async fn market(&self, user_id: UserId, market: Market) -> Option<Arc<MarketChannels>> {
        let users = self.users.read().await;
        users.get(&user_id)?.markets.get(&market).cloned()
    }

    pub async fn contains(&self, user_id: UserId, market: Market) -> bool {
        self.market(user_id, market).await.is_some()
    }

    /// 항목을 가져오고, 없으면 만듭니다.
    pub async fn ensure(&self, user_id: UserId, market: Market) -> Arc<MarketChannels> {
        if let Some(channels) = self.market(user_id, market).await {
            return channels;
        }
        let mut users = self.users.write().await;
        users
            .entry(user_id)
            .or_default()
            .markets
            .entry(market)
            .or_default()
            .clone()
    }

    /// 항목을 제거합니다. 사용자에게 남은 거래소가 없으면 사용자 묶음도 제거합니다.
    pub async fn remove(&self, user_id: UserId, market: Market) -> Option<Arc<MarketChannels>> {
        let mut users = self.users.write().await;
        let user = users.get_mut(&user_id)?;
        let removed = user.markets.remove(&market);
        if user.is_empty() {
            users.remove(&user_id);
        }
        removed
    }

    pub async fn set_cancel(&self, user_id: UserId, market: Market, token: CancellationToken) -> bool {
        match self.market(user_id, market).await {
            Some(channels) => {
                channels.set_cancel(token);
                true
            }
            None => false,
        }
    }

    pub async fn cancel(&self, user_id: UserId, market: Market) {
        if let Some(channels) = self.market(user_id, market).await {
            channels.cancel();
        }
    }

    /// 종료 신호를 보냅니다. 블로킹하지 않으며 중복 신호는 무시됩니다.
    pub async fn shutdown(&self, user_id: UserId, market: Market) -> bool {
        match self.market(user_id, market).await {
            Some(channels) => channels.shutdown(),
            None => false,
        }
    }

    pub async fn take_shutdown(&self, user_id: UserId, market: Market) -> bool {
        match self.market(user_id, market).await {
            Some(channels) => channels.take_shutdown(),
            None => false,
        }
    }

    pub async fn subscribe_signal(&self, user_id: UserId, market: Market, signal: PairSignal) -> bool {
        match self.market(user_id, market).await {
            Some(channels) => {
                channels.subscribe_signal(signal);
                true
            }
            None => false,
        }
    }

    pub async fn unsubscribe_signal(
        &self,
        user_id: UserId,
        market: Market,
        signal: PairSignal,
    ) -> bool {
        match self.market(user_id, market).await {
            Some(channels) => {
                channels.unsubscribe_signal(signal);
                true
            }
            None => false,
        }
    }

    /// 등록된 (사용자, 거래소) 항목 수.
    pub async fn len(&self) -> usize {
        let users = self.users.read().await;
        users.values().map(|u| u.markets.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
