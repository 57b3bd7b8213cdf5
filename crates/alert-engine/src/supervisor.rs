//! 스트림 감시자.
//!
//! (사용자, 거래소)마다 하나씩 실행되며 거래소 연결 하나를 단독으로 소유합니다.
//!
//! ```text
//! Disconnected → Connecting → Streaming → Closing → { Disconnected | Reconnecting → Connecting }
//! ```
//!
//! Streaming 상태에서는 세 태스크가 같은 연결을 공유합니다.
//! - 읽기 루프: 시세 디코딩 → 알림 검색 → 목표가/쿨다운 확인 → 알림 전송
//! - 제어 루프: 구독/구독 해제 신호 처리
//! - 종료 태스크: 연결별 취소 토큰이 취소되면 연결을 한 번만 닫음

use crate::channels::{MarketChannels, StreamState};
use crate::engine::EngineContext;
use crate::error::{EngineError, EngineResult};
use crate::store::StoreError;
use alert_core::{find_by_key, sort_by_key, Alert, AlertKey, ChatId, Market, UserId};
use alert_exchange::{ExchangeError, ExchangeResult, TickerConnection, TickerReader, TickerWriter};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

/// 연결이 수립되고 세션에 반영된 스트림.
pub(crate) struct Connected {
    pub conn: TickerConnection,
    /// 반영 시점의 알림 (키 순)
    pub alerts: Vec<Alert>,
    /// 연결할 때 구독한 페어
    pub subscribed: Vec<String>,
}

/// 거래소에 연결만 되고 아직 세션에 반영되지 않은 스트림.
struct Opened {
    conn: TickerConnection,
    pairs: Vec<String>,
    from_store: bool,
}

/// 읽기 루프 종료 사유.
#[derive(Debug)]
pub(crate) enum StreamExit {
    /// 연결별 취소 토큰 또는 프로세스 종료
    Cancelled,
    /// 세션에 남은 알림이 없음
    Drained,
    /// 읽기/디코딩 실패
    Failed(ExchangeError),
}

/// 연결하고 바로 반영합니다. 호출자가 lifecycle 락을 잡고 있어야 합니다.
pub(crate) async fn connect(
    ctx: &EngineContext,
    user_id: UserId,
    market: Market,
) -> EngineResult<Connected> {
    let opened = open(ctx, user_id, market).await?;
    commit(ctx, user_id, market, opened).await
}

/// 페어 목록을 구해 거래소에 연결합니다. 세션과 저장소는 건드리지 않습니다.
async fn open(ctx: &EngineContext, user_id: UserId, market: Market) -> EngineResult<Opened> {
    let adapter = ctx.adapter(market)?;
    let (alerts, from_store) = load_alerts(ctx, user_id, market).await?;
    let pairs: Vec<String> = alerts.into_iter().map(|a| a.pair).collect();

    let conn = adapter.connect(&pairs).await?;
    Ok(Opened {
        conn,
        pairs,
        from_store,
    })
}

/// 연결을 세션과 저장소에 반영합니다. 호출자가 lifecycle 락을 잡고 있어야 합니다.
///
/// 연결하는 동안 삭제된 알림은 되살리지 않습니다. 그런 페어는 제어 루프가 구독 해제합니다.
/// 남은 알림이 없거나 저장소 기록에 실패하면 연결을 닫고 에러를 반환합니다.
async fn commit(
    ctx: &EngineContext,
    user_id: UserId,
    market: Market,
    opened: Opened,
) -> EngineResult<Connected> {
    let Opened {
        conn,
        pairs,
        from_store,
    } = opened;

    if from_store {
        // 락을 잡은 뒤 다시 읽어 연결 중 삭제를 반영
        match stored_alerts(ctx, user_id, market).await {
            Ok(stored) => {
                ctx.session.add_alerts(user_id, stored).await;
            }
            Err(e) => {
                conn.writer.close().await;
                return Err(e);
            }
        }
    }

    let mut alerts = ctx.session.alerts_by_market(user_id, market).await;
    if alerts.is_empty() {
        conn.writer.close().await;
        return Err(EngineError::NoPairs);
    }
    for alert in &mut alerts {
        alert.connected = pairs.contains(&alert.pair);
    }

    let live: Vec<Alert> = alerts.iter().filter(|a| a.connected).cloned().collect();
    if !live.is_empty() {
        if let Err(e) = ctx.store.bulk_set_connected(user_id, &live, true).await {
            error!(user_id, %market, error = %e, "연결 상태 저장 실패, 연결 취소");
            conn.writer.close().await;
            return Err(e.into());
        }
    }

    ctx.session.add_alerts(user_id, alerts.clone()).await;
    ctx.session.set_market_connected(user_id, market, true).await;

    info!(user_id, %market, pairs = ?pairs, "스트림 연결 완료");
    Ok(Connected {
        conn,
        alerts,
        subscribed: pairs,
    })
}

/// 세션에서 알림을 읽고, 비어 있으면 저장소에서 읽습니다. 저장소에서 읽었으면 `true`.
async fn load_alerts(
    ctx: &EngineContext,
    user_id: UserId,
    market: Market,
) -> EngineResult<(Vec<Alert>, bool)> {
    let cached = ctx.session.alerts_by_market(user_id, market).await;
    if !cached.is_empty() {
        return Ok((cached, false));
    }

    let stored = stored_alerts(ctx, user_id, market).await?;
    if stored.is_empty() {
        return Err(EngineError::NoPairs);
    }
    Ok((stored, true))
}

async fn stored_alerts(ctx: &EngineContext, user_id: UserId, market: Market) -> EngineResult<Vec<Alert>> {
    // 비정상 종료로 connected=true가 남은 알림도 포함
    let mut alerts = Vec::new();
    for connected in [false, true] {
        match ctx
            .store
            .get_connected_pairs_by_market(user_id, market, connected)
            .await
        {
            Ok((_, found)) => alerts.extend(found),
            Err(StoreError::NoPairs | StoreError::UserNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    sort_by_key(&mut alerts);
    Ok(alerts)
}

/// (사용자, 거래소) 스트림 감시자.
pub(crate) struct StreamSupervisor {
    ctx: Arc<EngineContext>,
    user_id: UserId,
    chat_id: ChatId,
    market: Market,
}

impl StreamSupervisor {
    pub(crate) fn new(ctx: Arc<EngineContext>, user_id: UserId, chat_id: ChatId, market: Market) -> Self {
        Self {
            ctx,
            user_id,
            chat_id,
            market,
        }
    }

    async fn channels(&self) -> Option<Arc<MarketChannels>> {
        self.ctx.registry.market(self.user_id, self.market).await
    }

    async fn set_state(&self, state: StreamState) {
        if let Some(channels) = self.channels().await {
            channels.set_state(state);
        }
    }

    /// 감시자 메인 루프. `initial`이 없으면 먼저 연결합니다.
    pub(crate) async fn run(self, initial: Option<Connected>) {
        let mut pending = initial;
        let mut after_failure = false;
        let mut failures: u32 = 0;

        loop {
            let connected = match pending.take() {
                Some(connected) => connected,
                None => match self.connect_with_retry(after_failure, &mut failures).await {
                    Some(connected) => connected,
                    None => break,
                },
            };

            let exit = self.stream(connected).await;
            // 거래소가 거부한 구독은 재연결해도 반복되므로 시도 횟수를 이어서 셈
            match &exit {
                StreamExit::Failed(e) if !e.is_retryable() => failures += 1,
                _ => failures = 0,
            }
            if !self.handle_exit(exit).await {
                break;
            }
            after_failure = true;
        }

        debug!("스트림 감시자 종료");
    }

    /// 백오프를 적용하며 연결을 시도합니다. 포기하거나 종료되면 `None`.
    async fn connect_with_retry(&self, wait_first: bool, failures: &mut u32) -> Option<Connected> {
        let policy = &self.ctx.config.reconnect;
        let mut wait = wait_first;

        loop {
            if wait {
                let failures = *failures;
                if policy.exhausted(failures) {
                    error!(attempts = failures, "최대 재연결 시도 횟수 초과, 스트림 중단");
                    self.teardown(true).await;
                    return None;
                }

                self.set_state(StreamState::Reconnecting).await;
                let delay = policy.delay_for(failures);
                debug!(?delay, attempt = failures + 1, "재연결 대기");
                tokio::select! {
                    _ = self.ctx.root.cancelled() => {
                        self.teardown(true).await;
                        return None;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            wait = true;

            self.set_state(StreamState::Connecting).await;
            match self.connect().await {
                Ok(Some(connected)) => return Some(connected),
                Ok(None) => {
                    debug!("레지스트리 항목이 사라져 연결 취소");
                    return None;
                }
                Err(EngineError::NoPairs) => {
                    if self.teardown(false).await {
                        info!("스트리밍할 페어가 없어 종료");
                        return None;
                    }
                }
                Err(e) => {
                    *failures += 1;
                    warn!(attempt = *failures, error = %e, "재연결 실패");
                }
            }
        }
    }

    /// 락 없이 연결한 뒤 lifecycle 락을 잡고 반영합니다. 항목이 정리되었으면 `None`.
    async fn connect(&self) -> EngineResult<Option<Connected>> {
        let opened = open(&self.ctx, self.user_id, self.market).await?;

        let channels = match self.channels().await {
            Some(channels) if !channels.is_retired() => channels,
            _ => {
                opened.conn.writer.close().await;
                return Ok(None);
            }
        };
        let _guard = channels.lock_lifecycle().await;
        if channels.is_retired() {
            opened.conn.writer.close().await;
            return Ok(None);
        }
        commit(&self.ctx, self.user_id, self.market, opened).await.map(Some)
    }

    /// Streaming 상태. 읽기 루프가 끝나면 제어/종료 태스크를 정리하고 종료 사유를 반환합니다.
    async fn stream(&self, connected: Connected) -> StreamExit {
        let Connected {
            conn,
            alerts,
            subscribed,
        } = connected;
        let TickerConnection { reader, writer } = conn;

        let Some(channels) = self.channels().await else {
            writer.close().await;
            return StreamExit::Cancelled;
        };

        let token = self.ctx.root.child_token();
        channels.set_cancel(token.clone());
        channels.set_state(StreamState::Streaming);
        let revision = channels.revision();
        drop(channels);

        let closer = {
            let token = token.clone();
            let writer = writer.clone();
            self.ctx.tracker.spawn(async move {
                token.cancelled().await;
                writer.close().await;
            })
        };

        let control = ControlLoop {
            ctx: self.ctx.clone(),
            user_id: self.user_id,
            chat_id: self.chat_id,
            market: self.market,
            writer,
            token: token.clone(),
            subscribed: subscribed.into_iter().collect(),
        };
        let control = self
            .ctx
            .tracker
            .spawn(control.run().instrument(Span::current()));

        let exit = self.read_loop(reader, &token, alerts, revision).await;

        token.cancel();
        if let Err(e) = control.await {
            error!("제어 루프 비정상 종료: {}", e);
        }
        if let Err(e) = closer.await {
            error!("연결 종료 태스크 비정상 종료: {}", e);
        }
        self.set_state(StreamState::Closing).await;

        exit
    }

    /// 읽기 루프.
    async fn read_loop(
        &self,
        mut reader: Box<dyn TickerReader>,
        token: &CancellationToken,
        mut snapshot: Vec<Alert>,
        mut seen_revision: u64,
    ) -> StreamExit {
        let policy = self.ctx.config.signal_policy;

        loop {
            let tick = tokio::select! {
                _ = token.cancelled() => return StreamExit::Cancelled,
                next = reader.next_tick() => match next {
                    Ok(tick) => tick,
                    Err(e) => return StreamExit::Failed(e),
                },
            };
            if tick.symbol.is_empty() {
                continue;
            }

            // 생성/삭제로 세션이 바뀌었으면 스냅샷 갱신
            match self.channels().await.map(|c| c.revision()) {
                None => return StreamExit::Cancelled,
                Some(revision) if revision != seen_revision => {
                    seen_revision = revision;
                    snapshot = self.refresh_snapshot().await;
                }
                Some(_) => {}
            }

            let key = AlertKey::new(self.market, &tick.symbol);
            let idx = match find_by_key(&snapshot, &key) {
                Some(idx) => idx,
                None => {
                    // 구독 직후 첫 시세가 세션 반영보다 먼저 올 수 있음
                    snapshot = self.refresh_snapshot().await;
                    if snapshot.is_empty() {
                        info!("남은 알림이 없어 스트림 종료");
                        return StreamExit::Drained;
                    }
                    match find_by_key(&snapshot, &key) {
                        Some(idx) => idx,
                        None => {
                            debug!(symbol = %tick.symbol, "일치하는 알림 없음");
                            continue;
                        }
                    }
                }
            };

            let now = Utc::now();
            let alert = &mut snapshot[idx];
            if !alert.should_signal(tick.last_price, now, &policy) {
                continue;
            }

            info!(
                pair = %alert.pair,
                price = tick.last_price,
                target = alert.target_price,
                "목표가 도달, 알림 전송"
            );
            let sent = tokio::select! {
                _ = token.cancelled() => return StreamExit::Cancelled,
                sent = self.ctx.sink.send_alert(self.chat_id, &tick.symbol, tick.last_price) => sent,
            };
            if let Err(e) = sent {
                warn!(sink = self.ctx.sink.name(), error = %e, "알림 전송 실패");
            }
            alert.last_signal_at = Some(now);
            self.ctx.session.mark_signaled(self.user_id, &key, now).await;
        }
    }

    async fn refresh_snapshot(&self) -> Vec<Alert> {
        self.ctx
            .session
            .alerts_by_market(self.user_id, self.market)
            .await
    }

    /// 읽기 루프 종료 후 처리. 재연결해야 하면 `true`.
    async fn handle_exit(&self, exit: StreamExit) -> bool {
        let (user_id, market) = (self.user_id, self.market);
        self.ctx.session.set_alerts_connected(user_id, market, false).await;
        self.ctx.session.set_market_connected(user_id, market, false).await;

        let shutdown_pending = match self.channels().await {
            Some(channels) => channels.take_shutdown(),
            None => true,
        };
        let intentional = shutdown_pending
            || self.ctx.root.is_cancelled()
            || matches!(exit, StreamExit::Drained);

        if intentional {
            debug!(?exit, "요청된 종료");
            if self.teardown(false).await {
                return false;
            }
            info!("종료 처리 중 알림이 추가되어 다시 연결");
            return true;
        }

        match &exit {
            StreamExit::Failed(e) => warn!(error = %e, retryable = e.is_retryable(), "연결 끊김, 재연결"),
            _ => warn!("구독 처리 실패로 연결 취소, 재연결"),
        }

        let alerts = self.ctx.session.alerts_by_market(user_id, market).await;
        if !alerts.is_empty() {
            if let Err(e) = self.ctx.store.bulk_set_connected(user_id, &alerts, false).await {
                error!(error = %e, "연결 해제 상태 저장 실패");
            }
        }
        true
    }

    /// 레지스트리 항목을 제거하고 감시자를 끝냅니다.
    ///
    /// `force`가 아니면 세션에 이 거래소 알림이 남아 있을 때 정리하지 않고 `false`를 반환합니다.
    async fn teardown(&self, force: bool) -> bool {
        let Some(channels) = self.channels().await else {
            return true;
        };
        let _guard = channels.lock_lifecycle().await;

        if !force
            && !self.ctx.root.is_cancelled()
            && self
                .ctx
                .session
                .market_alert_count(self.user_id, self.market)
                .await
                > 0
        {
            return false;
        }

        channels.retire();
        channels.cancel();
        self.ctx.registry.remove(self.user_id, self.market).await;
        self.ctx
            .session
            .set_market_connected(self.user_id, self.market, false)
            .await;
        info!("스트림 정리 완료");
        true
    }
}

/// 구독/구독 해제 신호를 처리하는 제어 루프.
struct ControlLoop {
    ctx: Arc<EngineContext>,
    user_id: UserId,
    chat_id: ChatId,
    market: Market,
    writer: Arc<dyn TickerWriter>,
    token: CancellationToken,
    /// 연결에 실제로 구독된 페어
    subscribed: HashSet<String>,
}

impl ControlLoop {
    async fn run(mut self) {
        let Some(channels) = self.channels().await else {
            self.token.cancel();
            return;
        };
        // 연결 중에 바뀐 알림 반영
        if let Err(e) = self.reconcile(&channels).await {
            self.fail(e);
            return;
        }

        loop {
            let Some(channels) = self.channels().await else {
                self.token.cancel();
                return;
            };

            tokio::select! {
                _ = self.token.cancelled() => return,
                signal = channels.recv_subscribe() => {
                    debug!(pair = %signal.pair, remaining = signal.remaining, "구독 신호");
                    if let Err(e) = self.reconcile(&channels).await {
                        self.fail(e);
                        return;
                    }
                }
                signal = channels.recv_unsubscribe() => {
                    debug!(pair = %signal.pair, remaining = signal.remaining, "구독 해제 신호");
                    let remaining = match self.reconcile(&channels).await {
                        Ok(remaining) => remaining,
                        Err(e) => {
                            self.fail(e);
                            return;
                        }
                    };
                    if signal.remaining <= 0 && remaining == 0 {
                        info!("마지막 알림 삭제, 스트림 종료");
                        channels.shutdown();
                        self.token.cancel();
                        return;
                    }
                }
            }
        }
    }

    async fn channels(&self) -> Option<Arc<MarketChannels>> {
        self.ctx.registry.market(self.user_id, self.market).await
    }

    fn fail(&self, e: ExchangeError) {
        error!(error = %e, "구독 변경 실패, 연결 취소");
        self.token.cancel();
    }

    /// 세션 스냅샷과 실제 구독 목록을 맞춥니다. 남은 알림 수를 반환합니다.
    async fn reconcile(&mut self, channels: &MarketChannels) -> ExchangeResult<usize> {
        let snapshot = self
            .ctx
            .session
            .alerts_by_market(self.user_id, self.market)
            .await;
        let wanted: HashSet<String> = snapshot.iter().map(|a| a.pair.clone()).collect();

        let mut stale: Vec<String> = self.subscribed.difference(&wanted).cloned().collect();
        stale.sort();
        for pair in stale {
            self.writer.unsubscribe(&pair).await?;
            self.subscribed.remove(&pair);
            info!(pair = %pair, "구독 해제");
        }

        let mut added: Vec<String> = wanted.difference(&self.subscribed).cloned().collect();
        added.sort();
        for pair in &added {
            self.writer.subscribe(pair).await?;
            info!(pair = %pair, "구독 추가");
            self.subscribed.insert(pair.clone());
        }

        // 생성 요청의 확인 메시지는 페어가 연결에 실린 뒤 한 번만 보냄
        let confirmations = self
            .subscribed
            .iter()
            .filter(|pair| channels.take_confirmation(pair))
            .count();
        for _ in 0..confirmations {
            self.confirm().await;
        }

        if !added.is_empty() {
            let joined: Vec<Alert> = snapshot
                .into_iter()
                .filter(|a| added.contains(&a.pair))
                .collect();
            if let Err(e) = self
                .ctx
                .store
                .bulk_set_connected(self.user_id, &joined, true)
                .await
            {
                error!(error = %e, "연결 상태 저장 실패");
            }
            self.ctx
                .session
                .set_alerts_connected(self.user_id, self.market, true)
                .await;
        }

        Ok(wanted.len())
    }

    /// 구독 확인 메시지를 보냅니다. 연결이 취소되면 기다리지 않습니다.
    async fn confirm(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            sent = self.ctx.sink.send_subscription_confirmed(self.chat_id) => {
                if let Err(e) = sent {
                    warn!(sink = self.ctx.sink.name(), error = %e, "구독 확인 전송 실패");
                }
            }
        }
    }
}
