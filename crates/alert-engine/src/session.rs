//! 사용자별 알림 캐시 (Session).
//!
//! 읽기 루프가 시세마다 저장소를 조회하지 않도록 사용자별 알림 목록과 거래소별
//! 연결 상태를 메모리에 보관합니다. 알림 목록은 항상 [`AlertKey`] 순으로 정렬되어
//! 있습니다.
//!
//! 조회 함수는 모두 사본을 반환하므로 호출자는 락을 잡은 채 네트워크 I/O를 하지 않습니다.

use alert_core::{find_by_key, Alert, AlertKey, Market, UserId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 거래소별 스트림 연결 여부.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarketState {
    pub binance: bool,
    pub huobi: bool,
}

impl MarketState {
    pub fn get(&self, market: Market) -> bool {
        match market {
            Market::Binance => self.binance,
            Market::Huobi => self.huobi,
        }
    }

    pub fn set(&mut self, market: Market, connected: bool) {
        match market {
            Market::Binance => self.binance = connected,
            Market::Huobi => self.huobi = connected,
        }
    }

    pub fn any(&self) -> bool {
        self.binance || self.huobi
    }
}

#[derive(Debug, Default)]
struct UserSession {
    /// 키 순 정렬
    alerts: Vec<Alert>,
    markets: MarketState,
}

impl UserSession {
    fn is_evictable(&self) -> bool {
        self.alerts.is_empty() && !self.markets.any()
    }

    /// 정렬 위치에 삽입합니다. 같은 키가 있으면 목표가/연결 상태만 갱신하고
    /// 마지막 발송 시각은 더 최근 값을 유지합니다.
    fn upsert(&mut self, alert: Alert) -> bool {
        match self.alerts.binary_search_by(|a| a.key.cmp(&alert.key)) {
            Ok(idx) => {
                let existing = &mut self.alerts[idx];
                existing.target_price = alert.target_price;
                existing.connected = alert.connected;
                existing.last_signal_at = existing.last_signal_at.max(alert.last_signal_at);
                false
            }
            Err(idx) => {
                self.alerts.insert(idx, alert);
                true
            }
        }
    }
}

/// 프로세스 전역 알림 캐시.
#[derive(Debug, Default)]
pub struct Session {
    users: RwLock<HashMap<UserId, UserSession>>,
}

pub type SharedSession = Arc<Session>;

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// 사용자 항목을 만들고 거래소 상태를 초기화합니다.
    pub async fn init_markets(&self, user_id: UserId) {
        let mut users = self.users.write().await;
        users.entry(user_id).or_default().markets = MarketState::default();
    }

    /// 알림을 추가합니다. 새로 추가된 개수를 반환합니다.
    pub async fn add_alerts(&self, user_id: UserId, alerts: impl IntoIterator<Item = Alert>) -> usize {
        let mut users = self.users.write().await;
        let session = users.entry(user_id).or_default();
        alerts
            .into_iter()
            .map(|alert| session.upsert(alert))
            .filter(|inserted| *inserted)
            .count()
    }

    /// 사용자의 전체 알림 (키 순).
    pub async fn alerts_by_id(&self, user_id: UserId) -> Vec<Alert> {
        let users = self.users.read().await;
        users
            .get(&user_id)
            .map(|s| s.alerts.clone())
            .unwrap_or_default()
    }

    /// 사용자의 특정 거래소 알림 (키 순).
    pub async fn alerts_by_market(&self, user_id: UserId, market: Market) -> Vec<Alert> {
        let users = self.users.read().await;
        users
            .get(&user_id)
            .map(|s| {
                s.alerts
                    .iter()
                    .filter(|a| a.market == market)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 특정 거래소의 알림 개수.
    pub async fn market_alert_count(&self, user_id: UserId, market: Market) -> usize {
        let users = self.users.read().await;
        users
            .get(&user_id)
            .map(|s| s.alerts.iter().filter(|a| a.market == market).count())
            .unwrap_or(0)
    }

    pub async fn contains(&self, user_id: UserId, key: &AlertKey) -> bool {
        let users = self.users.read().await;
        users
            .get(&user_id)
            .and_then(|s| find_by_key(&s.alerts, key))
            .is_some()
    }

    /// 키로 알림 하나를 삭제합니다.
    ///
    /// 위치가 아니라 키로 찾으므로 동시에 들어온 삭제 요청끼리 서로의 대상을 지우지 않습니다.
    pub async fn delete_alert(&self, user_id: UserId, key: &AlertKey) -> Option<Alert> {
        let mut users = self.users.write().await;
        let session = users.get_mut(&user_id)?;
        let idx = find_by_key(&session.alerts, key)?;
        let removed = session.alerts.remove(idx);
        if session.is_evictable() {
            users.remove(&user_id);
        }
        Some(removed)
    }

    /// 사용자의 알림을 모두 삭제하고 반환합니다.
    pub async fn delete_alerts(&self, user_id: UserId) -> Vec<Alert> {
        let mut users = self.users.write().await;
        let Some(session) = users.get_mut(&user_id) else {
            return Vec::new();
        };
        let removed = std::mem::take(&mut session.alerts);
        if session.is_evictable() {
            users.remove(&user_id);
        }
        removed
    }

    /// 거래소 스트림 연결 여부를 기록합니다.
    pub async fn set_market_connected(&self, user_id: UserId, market: Market, connected: bool) {
        let mut users = self.users.write().await;
        if connected {
            users.entry(user_id).or_default().markets.set(market, true);
            return;
        }
        if let Some(session) = users.get_mut(&user_id) {
            session.markets.set(market, false);
            if session.is_evictable() {
                users.remove(&user_id);
            }
        }
    }

    pub async fn market_connected(&self, user_id: UserId, market: Market) -> bool {
        let users = self.users.read().await;
        users
            .get(&user_id)
            .map(|s| s.markets.get(market))
            .unwrap_or(false)
    }

    /// 특정 거래소 알림들의 `connected` 플래그를 갱신합니다.
    pub async fn set_alerts_connected(&self, user_id: UserId, market: Market, connected: bool) {
        let mut users = self.users.write().await;
        if let Some(session) = users.get_mut(&user_id) {
            session
                .alerts
                .iter_mut()
                .filter(|a| a.market == market)
                .for_each(|a| a.connected = connected);
        }
    }

    /// 알림 발송 시각을 기록합니다. 스냅샷을 새로 받아도 쿨다운이 유지됩니다.
    pub async fn mark_signaled(&self, user_id: UserId, key: &AlertKey, at: DateTime<Utc>) -> bool {
        let mut users = self.users.write().await;
        let Some(session) = users.get_mut(&user_id) else {
            return false;
        };
        match find_by_key(&session.alerts, key) {
            Some(idx) => {
                session.alerts[idx].last_signal_at = Some(at);
                true
            }
            None => false,
        }
    }

    /// 전체 사용자의 알림 수.
    pub async fn alerts_count(&self) -> usize {
        let users = self.users.read().await;
        users.values().map(|s| s.alerts.len()).sum()
    }

    pub async fn has_user(&self, user_id: UserId) -> bool {
        self.users.read().await.contains_key(&user_id)
    }

    /// 모든 사용자의 알림 사본 (종료 처리용).
    pub async fn snapshot_all(&self) -> Vec<(UserId, Vec<Alert>)> {
        let users = self.users.read().await;
        users
            .iter()
            .map(|(user_id, s)| (*user_id, s.alerts.clone()))
            .collect()
    }
}
