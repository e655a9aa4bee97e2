use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, trace};

use super::{Connection, Record, Transport};
use crate::{error::TransportError, identity::ConnectorIdentity, lane::parse_address};

/// Upper bound of records returned per address by one fetch.
pub const MAX_FETCH_RECORDS: usize = 500;

static NAMED: OnceLock<DashMap<String, MemoryBroker>> = OnceLock::new();

/// In-process broker: one append-only log per address and committed offsets
/// per consumer group.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    appended: Notify,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<String>>,
    committed: HashMap<(String, String), u64>,
    heartbeats: HashMap<String, DateTime<Utc>>,
    /// Last non-empty fetch per lane consumer client id.
    fetches: HashMap<String, DateTime<Utc>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The broker registered under `url`, created on first use.
    ///
    /// Every bus client in this process that uses the same `memory://` address
    /// shares one broker.
    pub fn named(url: &str) -> Self {
        NAMED
            .get_or_init(DashMap::new)
            .entry(url.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        self.inner
            .state
            .lock()
            .map_err(|_| TransportError::Unavailable("memory broker lock poisoned".into()))
    }

    /// Appends a raw record, bypassing envelope encoding.
    pub fn append(&self, address: &str, payload: impl Into<String>) -> Result<u64, TransportError> {
        let offset = {
            let mut state = self.state()?;
            let log = state.logs.entry(address.to_string()).or_default();
            log.push(payload.into());
            (log.len() - 1) as u64
        };
        self.inner.appended.notify_waiters();
        trace!(%address, offset, "appended record");
        Ok(offset)
    }

    /// Snapshot of every payload stored at `address`.
    pub fn records(&self, address: &str) -> Vec<String> {
        self.state()
            .map(|state| state.logs.get(address).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, group: &str, address: &str) -> Option<u64> {
        self.state()
            .ok()?
            .committed
            .get(&(group.to_string(), address.to_string()))
            .copied()
    }

    pub fn last_heartbeat(&self, client_id: &str) -> Option<DateTime<Utc>> {
        self.state().ok()?.heartbeats.get(client_id).copied()
    }

    /// When the lane consumer `lane_client_id` last received records.
    pub fn last_fetch(&self, lane_client_id: &str) -> Option<DateTime<Utc>> {
        self.state().ok()?.fetches.get(lane_client_id).copied()
    }

    fn take_ready(
        &self,
        positions: &mut HashMap<String, u64>,
        addresses: &[String],
    ) -> Result<Vec<Record>, TransportError> {
        let state = self.state()?;
        let mut ready = Vec::new();
        for address in addresses {
            let position = positions
                .get_mut(address)
                .ok_or_else(|| TransportError::NotSubscribed(address.clone()))?;
            let Some(log) = state.logs.get(address) else {
                continue;
            };
            let start = *position as usize;
            for (offset, payload) in log.iter().enumerate().skip(start).take(MAX_FETCH_RECORDS) {
                ready.push(Record {
                    address: address.clone(),
                    offset: offset as u64,
                    payload: payload.clone(),
                });
                *position = offset as u64 + 1;
            }
        }
        Ok(ready)
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        identity: &ConnectorIdentity,
    ) -> Result<Box<dyn Connection>, TransportError> {
        debug!(
            group = identity.group_id(),
            client = identity.client_id(),
            "connected to memory broker"
        );
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            group: identity.group_id().to_string(),
            identity: identity.clone(),
            positions: HashMap::new(),
            closed: false,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    group: String,
    identity: ConnectorIdentity,
    positions: HashMap<String, u64>,
    closed: bool,
}

impl MemoryConnection {
    /// Records which lane consumers received `records`.
    fn note_fetched(&self, records: &[Record]) -> Result<(), TransportError> {
        let now = Utc::now();
        let mut state = self.broker.state()?;
        for record in records {
            let Some((topic, lane)) = parse_address(&record.address) else {
                continue;
            };
            let consumer = self.identity.lane_client_id(lane);
            trace!(%consumer, topic, offset = record.offset, "fetched record");
            state.fetches.insert(consumer, now);
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn subscribe(&mut self, addresses: &[String]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let state = self.broker.state()?;
        for address in addresses {
            if !self.positions.contains_key(address) {
                let committed = state
                    .committed
                    .get(&(self.group.clone(), address.clone()))
                    .copied()
                    .unwrap_or(0);
                self.positions.insert(address.clone(), committed);
            }
        }
        Ok(())
    }

    async fn fetch(
        &mut self,
        addresses: &[String],
        max_wait: Duration,
    ) -> Result<Vec<Record>, TransportError> {
        self.ensure_open()?;
        let deadline = Instant::now() + max_wait;
        loop {
            // registered before the check so an append in between still wakes us
            let appended = self.broker.inner.appended.notified();
            let ready = self.broker.take_ready(&mut self.positions, addresses)?;
            if !ready.is_empty() {
                self.note_fetched(&ready)?;
                return Ok(ready);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(ready);
            }
            if tokio::time::timeout(deadline - now, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn seek(&mut self, address: &str, offset: u64) -> Result<(), TransportError> {
        self.ensure_open()?;
        let position = self
            .positions
            .get_mut(address)
            .ok_or_else(|| TransportError::NotSubscribed(address.to_string()))?;
        *position = offset;
        Ok(())
    }

    async fn send(&mut self, address: &str, payload: String) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker.append(address, payload)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state()?;
        for (address, position) in &self.positions {
            state
                .committed
                .insert((self.group.clone(), address.clone()), *position);
        }
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.broker
            .state()?
            .heartbeats
            .insert(self.identity.client_id().to_string(), Utc::now());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.positions.clear();
        debug!(client = self.identity.client_id(), "memory connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{identity::BusArgs, lane::Lane};

    fn identity(group: &str) -> ConnectorIdentity {
        let args = BusArgs {
            kafka_url: Some("memory://broker-tests".into()),
            group_id: Some(group.into()),
            ..BusArgs::default()
        };
        ConnectorIdentity::resolve("eu.f4sten.test.Main", &args).unwrap()
    }

    fn addresses(list: &[&str]) -> Vec<String> {
        list.iter().map(|a| a.to_string()).collect()
    }

    #[tokio::test]
    async fn fetch_returns_records_in_log_order() {
        let broker = MemoryBroker::new();
        broker.append("t-NORMAL", "a").unwrap();
        broker.append("t-NORMAL", "b").unwrap();

        let mut conn = broker.connect(&identity("g")).await.unwrap();
        let subscribed = addresses(&["t-NORMAL"]);
        conn.subscribe(&subscribed).await.unwrap();
        let records = conn.fetch(&subscribed, Duration::ZERO).await.unwrap();

        let payloads: Vec<_> = records.iter().map(|r| r.payload.as_str()).collect();
        assert_eq!(payloads, vec!["a", "b"]);
        assert_eq!(records[1].offset, 1);
        assert!(conn.fetch(&subscribed, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uncommitted_records_are_redelivered_after_reconnect() {
        let broker = MemoryBroker::new();
        broker.append("t-NORMAL", "a").unwrap();
        let subscribed = addresses(&["t-NORMAL"]);

        let mut first = broker.connect(&identity("g")).await.unwrap();
        first.subscribe(&subscribed).await.unwrap();
        assert_eq!(first.fetch(&subscribed, Duration::ZERO).await.unwrap().len(), 1);
        first.close().await.unwrap();

        let mut second = broker.connect(&identity("g")).await.unwrap();
        second.subscribe(&subscribed).await.unwrap();
        assert_eq!(second.fetch(&subscribed, Duration::ZERO).await.unwrap().len(), 1);
        second.commit().await.unwrap();
        second.close().await.unwrap();

        let mut third = broker.connect(&identity("g")).await.unwrap();
        third.subscribe(&subscribed).await.unwrap();
        assert!(third.fetch(&subscribed, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(broker.committed_offset("g", "t-NORMAL"), Some(1));
    }

    #[tokio::test]
    async fn groups_track_positions_independently() {
        let broker = MemoryBroker::new();
        broker.append("t-NORMAL", "a").unwrap();
        let subscribed = addresses(&["t-NORMAL"]);

        let mut one = broker.connect(&identity("one")).await.unwrap();
        one.subscribe(&subscribed).await.unwrap();
        one.fetch(&subscribed, Duration::ZERO).await.unwrap();
        one.commit().await.unwrap();

        let mut two = broker.connect(&identity("two")).await.unwrap();
        two.subscribe(&subscribed).await.unwrap();
        assert_eq!(two.fetch(&subscribed, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fetch_wakes_up_when_a_record_arrives() {
        let broker = MemoryBroker::new();
        let subscribed = addresses(&["t-NORMAL"]);
        let mut conn = broker.connect(&identity("g")).await.unwrap();
        conn.subscribe(&subscribed).await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.append("t-NORMAL", "late").unwrap();
        });

        let records = conn.fetch(&subscribed, Duration::from_secs(5)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, "late");
    }

    #[tokio::test]
    async fn fetches_are_tracked_per_lane_consumer() {
        let broker = MemoryBroker::new();
        broker.append("t-PRIORITY", "p").unwrap();
        let id = identity("g");
        let subscribed = addresses(&["t-NORMAL", "t-PRIORITY"]);
        let mut conn = broker.connect(&id).await.unwrap();
        conn.subscribe(&subscribed).await.unwrap();
        conn.fetch(&subscribed, Duration::ZERO).await.unwrap();

        assert!(broker.last_fetch(&id.lane_client_id(Lane::Priority)).is_some());
        assert!(broker.last_fetch(&id.lane_client_id(Lane::Normal)).is_none());
    }

    #[tokio::test]
    async fn seek_moves_the_read_position() {
        let broker = MemoryBroker::new();
        broker.append("t-NORMAL", "a").unwrap();
        broker.append("t-NORMAL", "b").unwrap();
        let subscribed = addresses(&["t-NORMAL"]);
        let mut conn = broker.connect(&identity("g")).await.unwrap();
        conn.subscribe(&subscribed).await.unwrap();
        assert_eq!(conn.fetch(&subscribed, Duration::ZERO).await.unwrap().len(), 2);

        conn.seek("t-NORMAL", 1).await.unwrap();
        let again = conn.fetch(&subscribed, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].payload, "b");
        assert!(matches!(
            conn.seek("u-NORMAL", 0).await,
            Err(TransportError::NotSubscribed(_))
        ));
    }

    #[tokio::test]
    async fn fetch_gives_up_after_max_wait() {
        let broker = MemoryBroker::new();
        let subscribed = addresses(&["t-NORMAL"]);
        let mut conn = broker.connect(&identity("g")).await.unwrap();
        conn.subscribe(&subscribed).await.unwrap();
        let records = conn.fetch(&subscribed, Duration::from_millis(10)).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn unsubscribed_address_is_an_error() {
        let broker = MemoryBroker::new();
        let mut conn = broker.connect(&identity("g")).await.unwrap();
        let err = conn
            .fetch(&addresses(&["nowhere-NORMAL"]), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotSubscribed(a) if a == "nowhere-NORMAL"));
    }

    #[tokio::test]
    async fn closed_connection_refuses_work() {
        let broker = MemoryBroker::new();
        let mut conn = broker.connect(&identity("g")).await.unwrap();
        conn.close().await.unwrap();
        assert!(matches!(
            conn.send("t-NORMAL", "x".into()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn heartbeat_is_recorded_per_client() {
        let broker = MemoryBroker::new();
        let id = identity("g");
        let mut conn = broker.connect(&id).await.unwrap();
        conn.heartbeat().await.unwrap();
        assert!(broker.last_heartbeat(id.client_id()).is_some());
    }

    #[test]
    fn named_brokers_are_shared() {
        let a = MemoryBroker::named("memory://shared-test");
        let b = MemoryBroker::named("memory://shared-test");
        a.append("x-NORMAL", "1").unwrap();
        assert_eq!(b.records("x-NORMAL"), vec!["1".to_string()]);
        assert!(MemoryBroker::named("memory://other-test").records("x-NORMAL").is_empty());
    }
}
