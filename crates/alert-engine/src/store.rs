//! 알림 영속 저장소 계약.
//!
//! 엔진은 저장소 구현을 모르고 [`AlertStore`] trait만 사용합니다. 저장소는 재시작 후
//! 복구의 기준이고, 실행 중의 기준은 [`Session`](crate::session::Session)입니다.
//! 둘은 연결/해제 시점에만 동기화되는 최종적 일관성 관계입니다.

use alert_core::{Alert, ChatId, Market, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// 저장소 에러.
#[derive(Debug, Error)]
pub enum StoreError {
    /// 해당 조건의 페어가 없음 (에러가 아닌 신호로 취급)
    #[error("no pairs")]
    NoPairs,

    #[error("사용자를 찾을 수 없음: {0}")]
    UserNotFound(UserId),

    #[error("알림을 찾을 수 없음: {market} {pair}")]
    AlertNotFound { market: Market, pair: String },

    #[error("이미 존재하는 알림: {market} {pair}")]
    AlertExists { market: Market, pair: String },

    #[error("저장소 에러: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 저장된 사용자 레코드.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUser {
    pub user_id: UserId,
    pub chat_id: ChatId,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

/// 사용자별 알림 저장소.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// 사용자의 모든 알림.
    async fn get_alerts_for_user(&self, user_id: UserId) -> StoreResult<Vec<Alert>>;

    /// 특정 거래소에서 `connected` 플래그가 일치하는 알림과 페어 목록.
    ///
    /// 일치하는 알림이 없으면 [`StoreError::NoPairs`]를 반환합니다.
    async fn get_connected_pairs_by_market(
        &self,
        user_id: UserId,
        market: Market,
        connected: bool,
    ) -> StoreResult<(Vec<String>, Vec<Alert>)>;

    /// 알림을 추가합니다. 사용자 레코드가 없으면 만듭니다.
    async fn add_alert(&self, user_id: UserId, chat_id: ChatId, alert: &Alert) -> StoreResult<()>;

    /// 거래소/페어로 알림 하나를 삭제합니다.
    async fn remove_alert(&self, user_id: UserId, market: Market, pair: &str) -> StoreResult<()>;

    /// 주어진 알림들을 삭제합니다.
    async fn delete_alerts(&self, user_id: UserId, alerts: &[Alert]) -> StoreResult<()>;

    /// 주어진 알림들의 `connected` 플래그를 한 번에 갱신합니다.
    async fn bulk_set_connected(
        &self,
        user_id: UserId,
        alerts: &[Alert],
        connected: bool,
    ) -> StoreResult<()>;

    /// 알림이 하나 이상 있는 모든 사용자 (시작 시 복구용).
    async fn users_with_alerts(&self) -> StoreResult<Vec<StoredUser>>;
}

/// 메모리 기반 저장소.
///
/// 테스트와 단독 실행용입니다. 프로세스가 끝나면 내용이 사라집니다.
#[derive(Debug, Default)]
pub struct InMemoryAlertStore {
    users: RwLock<HashMap<UserId, StoredUser>>,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 사용자 레코드로 초기화합니다.
    pub fn with_users(users: impl IntoIterator<Item = StoredUser>) -> Self {
        let users = users.into_iter().map(|u| (u.user_id, u)).collect();
        Self {
            users: RwLock::new(users),
        }
    }

    /// 사용자 레코드 사본.
    pub async fn user(&self, user_id: UserId) -> Option<StoredUser> {
        self.users.read().await.get(&user_id).cloned()
    }
}

#[async_trait]
impl AlertStore for InMemoryAlertStore {
    async fn get_alerts_for_user(&self, user_id: UserId) -> StoreResult<Vec<Alert>> {
        let users = self.users.read().await;
        Ok(users
            .get(&user_id)
            .map(|u| u.alerts.clone())
            .unwrap_or_default())
    }

    async fn get_connected_pairs_by_market(
        &self,
        user_id: UserId,
        market: Market,
        connected: bool,
    ) -> StoreResult<(Vec<String>, Vec<Alert>)> {
        let users = self.users.read().await;
        let user = users.get(&user_id).ok_or(StoreError::UserNotFound(user_id))?;

        let alerts: Vec<Alert> = user
            .alerts
            .iter()
            .filter(|a| a.market == market && a.connected == connected)
            .cloned()
            .collect();

        if alerts.is_empty() {
            return Err(StoreError::NoPairs);
        }
        let pairs = alerts.iter().map(|a| a.pair.clone()).collect();
        Ok((pairs, alerts))
    }

    async fn add_alert(&self, user_id: UserId, chat_id: ChatId, alert: &Alert) -> StoreResult<()> {
        let mut users = self.users.write().await;
        let user = users.entry(user_id).or_insert_with(|| StoredUser {
            user_id,
            chat_id,
            alerts: Vec::new(),
        });

        if user.alerts.iter().any(|a| a.key == alert.key) {
            return Err(StoreError::AlertExists {
                market: alert.market,
                pair: alert.pair.clone(),
            });
        }
        user.chat_id = chat_id;
        user.alerts.push(alert.clone());
        Ok(())
    }

    async fn remove_alert(&self, user_id: UserId, market: Market, pair: &str) -> StoreResult<()> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&user_id)
            .ok_or(StoreError::UserNotFound(user_id))?;

        let pair = pair.to_lowercase();
        let before = user.alerts.len();
        user.alerts.retain(|a| !(a.market == market && a.pair == pair));
        if user.alerts.len() == before {
            return Err(StoreError::AlertNotFound { market, pair });
        }
        Ok(())
    }

    async fn delete_alerts(&self, user_id: UserId, alerts: &[Alert]) -> StoreResult<()> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&user_id)
            .ok_or(StoreError::UserNotFound(user_id))?;
        user.alerts
            .retain(|a| !alerts.iter().any(|removed| removed.key == a.key));
        Ok(())
    }

    async fn bulk_set_connected(
        &self,
        user_id: UserId,
        alerts: &[Alert],
        connected: bool,
    ) -> StoreResult<()> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&user_id)
            .ok_or(StoreError::UserNotFound(user_id))?;
        for stored in user
            .alerts
            .iter_mut()
            .filter(|a| alerts.iter().any(|target| target.key == a.key))
        {
            stored.connected = connected;
        }
        Ok(())
    }

    async fn users_with_alerts(&self) -> StoreResult<Vec<StoredUser>> {
        let users = self.users.read().await;
        let mut result: Vec<StoredUser> = users
            .values()
            .filter(|u| !u.alerts.is_empty())
            .cloned()
            .collect();
        result.sort_by_key(|u| u.user_id);
        Ok(result)
    }
}
