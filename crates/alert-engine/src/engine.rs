//! 알림 엔진.
//!
//! 알림 생성/삭제 요청을 받아 세션, 저장소, 신호 레지스트리를 갱신하고
//! (사용자, 거래소)마다 스트림 감시자를 하나씩 띄웁니다.

use crate::channels::{ChannelRegistry, MarketChannels, SharedRegistry, StreamState};
use crate::error::{EngineError, EngineResult};
use crate::session::{Session, SharedSession};
use crate::store::AlertStore;
use crate::supervisor::{self, Connected, StreamSupervisor};
use alert_core::{
    Alert, AlertKey, AlertRemoval, AlertRequest, AppConfig, ChatId, Market, PairSignal,
    RemovalTarget, SignalPolicy, StreamConfig, UserId,
};
use alert_exchange::{BinanceAdapter, HuobiAdapter, ReconnectPolicy, TickerAdapter};
use alert_notification::NotificationSink;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

/// 엔진 동작 설정.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub signal_policy: SignalPolicy,
    pub reconnect: ReconnectPolicy,
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for EngineConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            signal_policy: config.signal_policy(),
            reconnect: ReconnectPolicy::from_config(config),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// 엔진과 감시자가 공유하는 상태.
pub(crate) struct EngineContext {
    pub session: SharedSession,
    pub registry: SharedRegistry,
    pub store: Arc<dyn AlertStore>,
    pub sink: Arc<dyn NotificationSink>,
    pub adapters: HashMap<Market, Arc<dyn TickerAdapter>>,
    /// 프로세스 종료 토큰. 연결별 토큰은 모두 이 토큰의 자식입니다.
    pub root: CancellationToken,
    pub tracker: TaskTracker,
    pub config: EngineConfig,
}

impl EngineContext {
    pub fn adapter(&self, market: Market) -> EngineResult<Arc<dyn TickerAdapter>> {
        self.adapters
            .get(&market)
            .cloned()
            .ok_or(EngineError::UnsupportedMarket(market))
    }
}

/// 알림 생성 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// 새 스트림을 열었음
    Started,
    /// 실행 중인 스트림에 구독 신호를 보냈음
    Subscribed,
    /// 스트림이 재연결 중. 다음 연결에 포함됨
    Pending,
}

/// 알림 삭제 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    /// 삭제된 알림 수
    pub removed: usize,
    /// 해당 거래소에 남은 알림 수
    pub remaining: usize,
}

/// 시작 시 복구 결과.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub users: usize,
    pub streams: usize,
}

/// 가격 알림 엔진.
pub struct AlertEngine {
    ctx: Arc<EngineContext>,
}

impl AlertEngine {
    /// 새 엔진을 생성합니다.
    pub fn new(
        store: Arc<dyn AlertStore>,
        sink: Arc<dyn NotificationSink>,
        adapters: Vec<Arc<dyn TickerAdapter>>,
        config: EngineConfig,
    ) -> Self {
        let adapters = adapters.into_iter().map(|a| (a.market(), a)).collect();
        let ctx = EngineContext {
            session: Arc::new(Session::new()),
            registry: Arc::new(ChannelRegistry::new()),
            store,
            sink,
            adapters,
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            config,
        };
        Self { ctx: Arc::new(ctx) }
    }

    /// 애플리케이션 설정으로 Binance/Huobi 어댑터를 구성해 엔진을 생성합니다.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn AlertStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let adapters: Vec<Arc<dyn TickerAdapter>> = vec![
            Arc::new(BinanceAdapter::new(config.exchanges.endpoint(Market::Binance))),
            Arc::new(HuobiAdapter::new(config.exchanges.endpoint(Market::Huobi))),
        ];
        Self::new(store, sink, adapters, EngineConfig::from(&config.stream))
    }

    pub fn session(&self) -> &SharedSession {
        &self.ctx.session
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.ctx.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ctx.root.is_cancelled()
    }

    /// 알림을 생성합니다.
    ///
    /// 해당 (사용자, 거래소)에 스트림이 없으면 연결을 열고 감시자를 띄웁니다.
    /// 첫 연결에 실패하면 저장소와 세션에서 알림을 되돌리고 에러를 반환합니다.
    pub async fn create_alert(&self, request: AlertRequest) -> EngineResult<CreateOutcome> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        request.validate()?;

        let ctx = &self.ctx;
        let (user_id, market) = (request.user_id, request.market);
        ctx.adapter(market)?;

        let alert = request.to_alert();
        if self.alert_exists(user_id, &alert.key).await? {
            return Err(EngineError::AlertExists {
                market,
                pair: alert.pair,
            });
        }

        loop {
            let channels = ctx.registry.ensure(user_id, market).await;
            let _guard = channels.lock_lifecycle().await;
            if channels.is_retired() {
                // 감시자가 정리 중인 항목. 새 항목으로 다시 시도
                continue;
            }

            if channels.try_claim() {
                return self
                    .start_stream(user_id, request.chat_id, alert, &channels)
                    .await;
            }

            let streaming = channels.state() == StreamState::Streaming;
            let mut alert = alert;
            alert.connected = streaming;
            ctx.store.add_alert(user_id, request.chat_id, &alert).await?;
            ctx.session.add_alerts(user_id, [alert.clone()]).await;
            channels.bump_revision();

            // 제어 루프가 아직 없으면 신호는 슬롯에 남아 있다가 첫 반영 때 처리됨
            channels.defer_confirmation(&alert.pair);
            let remaining = ctx.session.market_alert_count(user_id, market).await;
            channels.subscribe_signal(PairSignal::new(&alert.pair, remaining as i64));

            if !streaming {
                info!(user_id, %market, pair = %alert.pair, state = ?channels.state(), "스트림 연결 중, 다음 반영에 포함");
                return Ok(CreateOutcome::Pending);
            }
            info!(user_id, %market, pair = %alert.pair, "실행 중인 스트림에 구독 요청");
            return Ok(CreateOutcome::Subscribed);
        }
    }

    async fn alert_exists(&self, user_id: UserId, key: &AlertKey) -> EngineResult<bool> {
        if self.ctx.session.contains(user_id, key).await {
            return Ok(true);
        }
        let stored = self.ctx.store.get_alerts_for_user(user_id).await?;
        Ok(stored.iter().any(|a| &a.key == key))
    }

    /// 첫 알림으로 스트림을 엽니다. 호출자가 lifecycle 락과 소유권을 가지고 있어야 합니다.
    async fn start_stream(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        alert: Alert,
        channels: &MarketChannels,
    ) -> EngineResult<CreateOutcome> {
        let ctx = &self.ctx;
        let market = alert.market;
        channels.set_state(StreamState::Connecting);

        if let Err(e) = ctx.store.add_alert(user_id, chat_id, &alert).await {
            self.release(user_id, market, channels).await;
            return Err(e.into());
        }
        ctx.session.add_alerts(user_id, [alert.clone()]).await;

        let connected = match supervisor::connect(ctx, user_id, market).await {
            Ok(connected) => connected,
            Err(e) => {
                error!(user_id, %market, pair = %alert.pair, error = %e, "첫 연결 실패, 알림 생성 취소");
                if let Err(rollback) = ctx.store.remove_alert(user_id, market, &alert.pair).await {
                    error!(error = %rollback, "저장소 롤백 실패");
                }
                ctx.session.delete_alert(user_id, &alert.key).await;
                self.release(user_id, market, channels).await;
                return Err(e);
            }
        };

        self.spawn_supervisor(user_id, chat_id, market, Some(connected));

        if let Err(e) = ctx.sink.send_subscription_confirmed(chat_id).await {
            warn!(sink = ctx.sink.name(), error = %e, "구독 확인 전송 실패");
        }
        info!(user_id, %market, pair = %alert.pair, "새 스트림 시작");
        Ok(CreateOutcome::Started)
    }

    async fn release(&self, user_id: UserId, market: Market, channels: &MarketChannels) {
        channels.retire();
        self.ctx.registry.remove(user_id, market).await;
    }

    fn spawn_supervisor(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        market: Market,
        initial: Option<Connected>,
    ) {
        let supervisor = StreamSupervisor::new(self.ctx.clone(), user_id, chat_id, market);
        let span = alert_core::stream_span!("stream", user_id, market);
        self.ctx.tracker.spawn(supervisor.run(initial).instrument(span));
    }

    /// 알림을 삭제합니다.
    ///
    /// 저장소 삭제가 먼저 성공해야 세션과 스트림에 반영합니다.
    pub async fn remove_alert(&self, removal: AlertRemoval) -> EngineResult<RemoveOutcome> {
        let AlertRemoval {
            user_id,
            market,
            target,
        } = removal;
        match target {
            RemovalTarget::Pair(pair) => self.remove_pair(user_id, market, &pair).await,
            RemovalTarget::All => self.remove_all(user_id).await,
        }
    }

    async fn remove_pair(&self, user_id: UserId, market: Market, pair: &str) -> EngineResult<RemoveOutcome> {
        let ctx = &self.ctx;
        let pair = pair.to_lowercase();
        let key = AlertKey::new(market, &pair);

        let channels = ctx.registry.market(user_id, market).await;
        let _guard = match &channels {
            Some(channels) => Some(channels.lock_lifecycle().await),
            None => None,
        };

        ctx.store.remove_alert(user_id, market, &pair).await?;
        let removed = ctx.session.delete_alert(user_id, &key).await;
        let remaining = ctx.session.market_alert_count(user_id, market).await;

        if let Some(channels) = channels.as_ref().filter(|c| !c.is_retired()) {
            channels.take_confirmation(&pair);
            channels.bump_revision();
            channels.unsubscribe_signal(PairSignal::new(&pair, remaining as i64));
        }

        info!(user_id, %market, pair = %pair, remaining, "알림 삭제");
        Ok(RemoveOutcome {
            removed: usize::from(removed.is_some()),
            remaining,
        })
    }

    async fn remove_all(&self, user_id: UserId) -> EngineResult<RemoveOutcome> {
        let ctx = &self.ctx;

        let mut live = Vec::new();
        for market in Market::ALL {
            if let Some(channels) = ctx.registry.market(user_id, market).await {
                live.push(channels);
            }
        }
        let mut guards = Vec::with_capacity(live.len());
        for channels in &live {
            guards.push(channels.lock_lifecycle().await);
        }

        let stored = ctx.store.get_alerts_for_user(user_id).await?;
        if !stored.is_empty() {
            ctx.store.delete_alerts(user_id, &stored).await?;
        }
        let removed = ctx.session.delete_alerts(user_id).await;

        for channels in live.iter().filter(|c| !c.is_retired()) {
            channels.clear_confirmations();
            channels.bump_revision();
            channels.unsubscribe_signal(PairSignal::new("all", 0));
        }
        drop(guards);

        let removed = stored.len().max(removed.len());
        info!(user_id, removed, "모든 알림 삭제");
        Ok(RemoveOutcome {
            removed,
            remaining: 0,
        })
    }

    /// 저장소의 알림으로 세션을 채우고 (사용자, 거래소)마다 스트림을 다시 엽니다.
    ///
    /// 연결 실패는 감시자가 백오프로 재시도하므로 여기서는 에러가 되지 않습니다.
    pub async fn recover(&self) -> EngineResult<RecoveryReport> {
        let ctx = &self.ctx;
        let users = ctx.store.users_with_alerts().await?;
        let mut report = RecoveryReport::default();

        for user in users {
            report.users += 1;
            ctx.session.init_markets(user.user_id).await;

            let alerts: Vec<Alert> = user
                .alerts
                .into_iter()
                .map(|mut alert| {
                    alert.connected = false;
                    alert
                })
                .collect();
            let markets: BTreeSet<Market> = alerts.iter().map(|a| a.market).collect();
            ctx.session.add_alerts(user.user_id, alerts).await;

            for market in markets {
                if ctx.adapter(market).is_err() {
                    warn!(user_id = user.user_id, %market, "지원하지 않는 거래소, 복구 건너뜀");
                    continue;
                }
                let channels = ctx.registry.ensure(user.user_id, market).await;
                if !channels.try_claim() {
                    debug!(user_id = user.user_id, %market, "이미 실행 중인 스트림");
                    continue;
                }
                channels.set_state(StreamState::Connecting);
                self.spawn_supervisor(user.user_id, user.chat_id, market, None);
                report.streams += 1;
            }
        }

        info!(users = report.users, streams = report.streams, "알림 복구 완료");
        Ok(report)
    }

    /// 모든 스트림을 종료합니다.
    ///
    /// 루트 토큰 취소 → 감시자 종료 대기 → 저장소에 connected=false 기록 순서입니다.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let ctx = &self.ctx;
        info!(streams = ctx.registry.len().await, "엔진 종료 시작");

        ctx.root.cancel();
        ctx.tracker.close();
        let waited = tokio::time::timeout(ctx.config.shutdown_timeout, ctx.tracker.wait()).await;

        for (user_id, alerts) in ctx.session.snapshot_all().await {
            if alerts.is_empty() {
                continue;
            }
            if let Err(e) = ctx.store.bulk_set_connected(user_id, &alerts, false).await {
                error!(user_id, error = %e, "종료 상태 저장 실패");
            }
        }

        match waited {
            Ok(()) => {
                info!("엔진 종료 완료");
                Ok(())
            }
            Err(_) => {
                let secs = ctx.config.shutdown_timeout.as_secs();
                warn!(timeout_secs = secs, "스트림 종료 대기 시간 초과");
                Err(EngineError::ShutdownTimeout(secs))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_from_stream_config() {
        let stream = StreamConfig {
            reconnect_base_delay_ms: 5,
            max_reconnect_attempts: 3,
            cooldown_secs: 60,
            shutdown_timeout_secs: 2,
            ..Default::default()
        };
        let config = EngineConfig::from(&stream);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(5));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.signal_policy.cooldown, chrono::Duration::seconds(60));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
    }
}
