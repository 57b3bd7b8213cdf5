//! 엔진 통합 테스트용 스크립트 어댑터, 기록용 전송기/저장소.

#![allow(dead_code)]

use alert_core::{Alert, ChatId, Market, UserId};
use alert_engine::{
    AlertEngine, AlertStore, EngineConfig, InMemoryAlertStore, StoreError, StoreResult, StoredUser,
};
use alert_exchange::{
    ExchangeError, ExchangeResult, ReconnectPolicy, Tick, TickerAdapter, TickerConnection,
    TickerReader, TickerWriter,
};
use alert_notification::{NotificationResult, NotificationSink};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// 연결에 기록된 쓰기 동작.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireOp {
    Subscribe(String),
    Unsubscribe(String),
    Close,
}

/// 어댑터 하나가 만든 연결들의 기록.
#[derive(Default)]
pub struct MockExchange {
    /// 연결 시 전달된 페어 목록
    pub connects: Mutex<Vec<Vec<String>>>,
    /// 연결별 쓰기 기록
    pub ops: Mutex<Vec<Arc<Mutex<Vec<WireOp>>>>>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<ExchangeResult<Tick>>>>,
    /// 남은 연결 실패 횟수
    pub fail_connects: AtomicU32,
    /// 설정되어 있으면 연결이 풀릴 때까지 대기
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockExchange {
    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn last_pairs(&self) -> Vec<String> {
        self.connects.lock().unwrap().last().cloned().unwrap_or_default()
    }

    /// 가장 최근 연결의 쓰기 기록.
    pub fn last_ops(&self) -> Vec<WireOp> {
        self.ops
            .lock()
            .unwrap()
            .last()
            .map(|ops| ops.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn ops_of(&self, index: usize) -> Vec<WireOp> {
        self.ops.lock().unwrap()[index].lock().unwrap().clone()
    }

    /// 이후 연결 시도를 `release_connects`까지 멈춰 둡니다.
    pub fn hold_connects(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_connects(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.close();
        }
    }

    /// 가장 최근 연결로 시세를 보냅니다.
    pub fn tick(&self, symbol: &str, price: f64) {
        self.push(Ok(Tick::new(symbol, price)));
    }

    /// 가장 최근 연결의 읽기를 실패시킵니다.
    pub fn drop_connection(&self) {
        self.push(Err(ExchangeError::Disconnected("connection reset".to_string())));
    }

    fn push(&self, item: ExchangeResult<Tick>) {
        let feeds = self.feeds.lock().unwrap();
        let feed = feeds.last().expect("no connection");
        let _ = feed.send(item);
    }
}

pub struct MockAdapter {
    market: Market,
    pub exchange: Arc<MockExchange>,
}

impl MockAdapter {
    pub fn new(market: Market) -> Self {
        Self {
            market,
            exchange: Arc::new(MockExchange::default()),
        }
    }
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<ExchangeResult<Tick>>,
}

#[async_trait]
impl TickerReader for MockReader {
    async fn next_tick(&mut self) -> ExchangeResult<Tick> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(ExchangeError::Disconnected("feed dropped".to_string())),
        }
    }
}

struct MockWriter {
    ops: Arc<Mutex<Vec<WireOp>>>,
    closed: AtomicBool,
}

#[async_trait]
impl TickerWriter for MockWriter {
    async fn subscribe(&self, pair: &str) -> ExchangeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExchangeError::Disconnected("closed".to_string()));
        }
        self.ops.lock().unwrap().push(WireOp::Subscribe(pair.to_string()));
        Ok(())
    }

    async fn unsubscribe(&self, pair: &str) -> ExchangeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExchangeError::Disconnected("closed".to_string()));
        }
        self.ops.lock().unwrap().push(WireOp::Unsubscribe(pair.to_string()));
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.ops.lock().unwrap().push(WireOp::Close);
        }
    }
}

#[async_trait]
impl TickerAdapter for MockAdapter {
    fn market(&self) -> Market {
        self.market
    }

    async fn connect(&self, pairs: &[String]) -> ExchangeResult<TickerConnection> {
        let exchange = &self.exchange;
        exchange.connects.lock().unwrap().push(pairs.to_vec());

        let gate = exchange.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            // 닫히면 풀림
            let _ = gate.acquire().await;
        }

        let remaining = exchange.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            exchange.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(ExchangeError::NetworkError("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let ops = Arc::new(Mutex::new(Vec::new()));
        exchange.feeds.lock().unwrap().push(tx);
        exchange.ops.lock().unwrap().push(ops.clone());

        Ok(TickerConnection {
            reader: Box::new(MockReader { rx }),
            writer: Arc::new(MockWriter {
                ops,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

/// 전송된 메시지.
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Alert {
        chat_id: ChatId,
        symbol: String,
        price: f64,
    },
    Confirmed(ChatId),
}

#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<Sent>>,
    /// 설정되면 가격 알림 전송이 끝나지 않음
    pub hang_alerts: AtomicBool,
}

impl RecordingSink {
    pub fn alerts(&self) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| matches!(s, Sent::Alert { .. }))
            .cloned()
            .collect()
    }

    pub fn confirmations(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| matches!(s, Sent::Confirmed(_)))
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send_alert(&self, chat_id: ChatId, symbol: &str, price: f64) -> NotificationResult<()> {
        self.sent.lock().unwrap().push(Sent::Alert {
            chat_id,
            symbol: symbol.to_string(),
            price,
        });
        if self.hang_alerts.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn send_subscription_confirmed(&self, chat_id: ChatId) -> NotificationResult<()> {
        self.sent.lock().unwrap().push(Sent::Confirmed(chat_id));
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// `bulk_set_connected` 호출을 기록하고 추가 실패를 주입할 수 있는 저장소.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: InMemoryAlertStore,
    pub connected_writes: Mutex<Vec<(UserId, Vec<String>, bool)>>,
    pub fail_adds: AtomicBool,
}

impl RecordingStore {
    pub fn with_users(users: impl IntoIterator<Item = StoredUser>) -> Self {
        Self {
            inner: InMemoryAlertStore::with_users(users),
            ..Default::default()
        }
    }

    pub fn wrote_connected(&self, connected: bool) -> bool {
        self.connected_writes
            .lock()
            .unwrap()
            .iter()
            .any(|(_, _, flag)| *flag == connected)
    }
}

#[async_trait]
impl AlertStore for RecordingStore {
    async fn get_alerts_for_user(&self, user_id: UserId) -> StoreResult<Vec<Alert>> {
        self.inner.get_alerts_for_user(user_id).await
    }

    async fn get_connected_pairs_by_market(
        &self,
        user_id: UserId,
        market: Market,
        connected: bool,
    ) -> StoreResult<(Vec<String>, Vec<Alert>)> {
        self.inner
            .get_connected_pairs_by_market(user_id, market, connected)
            .await
    }

    async fn add_alert(&self, user_id: UserId, chat_id: ChatId, alert: &Alert) -> StoreResult<()> {
        if self.fail_adds.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write rejected".to_string()));
        }
        self.inner.add_alert(user_id, chat_id, alert).await
    }

    async fn remove_alert(&self, user_id: UserId, market: Market, pair: &str) -> StoreResult<()> {
        self.inner.remove_alert(user_id, market, pair).await
    }

    async fn delete_alerts(&self, user_id: UserId, alerts: &[Alert]) -> StoreResult<()> {
        self.inner.delete_alerts(user_id, alerts).await
    }

    async fn bulk_set_connected(
        &self,
        user_id: UserId,
        alerts: &[Alert],
        connected: bool,
    ) -> StoreResult<()> {
        let pairs = alerts.iter().map(|a| a.pair.clone()).collect();
        self.connected_writes
            .lock()
            .unwrap()
            .push((user_id, pairs, connected));
        self.inner.bulk_set_connected(user_id, alerts, connected).await
    }

    async fn users_with_alerts(&self) -> StoreResult<Vec<StoredUser>> {
        self.inner.users_with_alerts().await
    }
}

/// 테스트 하네스.
pub struct Harness {
    pub engine: AlertEngine,
    pub store: Arc<RecordingStore>,
    pub sink: Arc<RecordingSink>,
    pub binance: Arc<MockExchange>,
    pub huobi: Arc<MockExchange>,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            backoff_multiplier: 2.0,
            add_jitter: false,
        },
        shutdown_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(RecordingStore::default())
    }

    pub fn with_store(store: RecordingStore) -> Self {
        let store = Arc::new(store);
        let sink = Arc::new(RecordingSink::default());
        let binance = MockAdapter::new(Market::Binance);
        let huobi = MockAdapter::new(Market::Huobi);
        let (binance_exchange, huobi_exchange) = (binance.exchange.clone(), huobi.exchange.clone());

        let adapters: Vec<Arc<dyn TickerAdapter>> = vec![Arc::new(binance), Arc::new(huobi)];
        let engine = AlertEngine::new(store.clone(), sink.clone(), adapters, test_config());

        Self {
            engine,
            store,
            sink,
            binance: binance_exchange,
            huobi: huobi_exchange,
        }
    }
}

/// 조건이 참이 될 때까지 기다립니다. 2초 안에 되지 않으면 실패합니다.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// 잠시 기다려 비동기 작업이 진행되게 합니다.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
