//! The bus client every plugin drives from its own loop.

use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::{
    envelope::{Envelope, Failure, Provenance},
    error::{BusError, BusResult},
    identity::{ConnectorIdentity, DEFAULT_POLL_TIMEOUT_MS},
    lane::Lane,
    transport::{Connection, Record, Transport},
};

/// A record ready to be sent.
#[derive(Debug, Clone)]
struct Outgoing {
    address: String,
    payload: String,
}

/// Derived publishes queued by one callback.
///
/// Flushed by [`BusClient::poll`] when the callback returns `Ok`, discarded
/// when it fails.
#[derive(Debug)]
pub struct Outbox {
    provenance: Arc<Provenance>,
    pending: Vec<Outgoing>,
}

impl Outbox {
    pub(crate) fn new(provenance: Arc<Provenance>) -> Self {
        Self {
            provenance,
            pending: Vec::new(),
        }
    }

    /// Queues an origin envelope carrying `value`.
    pub fn publish<T>(&mut self, value: &T, topic: &str, lane: Lane) -> BusResult<()>
    where
        T: Serialize + ?Sized,
    {
        let outgoing = encode::<(), T>(&self.provenance, None, value, topic, lane)?;
        self.pending.push(outgoing);
        Ok(())
    }

    /// Queues an envelope carrying `value` whose `input` is `input`.
    pub fn publish_derived<U, T>(
        &mut self,
        input: &U,
        value: &T,
        topic: &str,
        lane: Lane,
    ) -> BusResult<()>
    where
        U: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        let outgoing = encode(&self.provenance, Some(input), value, topic, lane)?;
        self.pending.push(outgoing);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn encode<U, T>(
    provenance: &Provenance,
    input: Option<&U>,
    value: &T,
    topic: &str,
    lane: Lane,
) -> BusResult<Outgoing>
where
    U: Serialize + ?Sized,
    T: Serialize + ?Sized,
{
    if lane.is_error() {
        return Err(BusError::ErrorLaneReserved(topic.to_string()));
    }
    let address = lane.address(topic);
    let envelope: Envelope<&U, &T> = match input {
        Some(input) => Envelope::derived(input, value),
        None => Envelope::new(value),
    };
    let payload = serde_json::to_string(&envelope.stamped(provenance)).map_err(|source| {
        BusError::Encode {
            address: address.clone(),
            source,
        }
    })?;
    Ok(Outgoing { address, payload })
}

/// Raw record body as a JSON value, or as a string when it is not JSON.
fn raw_value(payload: &str) -> Value {
    serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()))
}

enum Delivery {
    Handled,
    /// Failure to report with `report` on the ERROR lane of the topic.
    Rejected { failure: Failure, report: String },
    /// Failure that is only logged.
    Dropped(Failure),
}

type Handler = Box<dyn FnMut(&Record, Lane, &mut Outbox) -> Delivery + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionKind {
    Consumer,
    ErrorMonitor,
}

struct Subscription {
    topic: String,
    kind: SubscriptionKind,
    handler: Handler,
}

impl SubscriptionKind {
    fn lanes(self) -> &'static [Lane] {
        match self {
            SubscriptionKind::Consumer => &Lane::CONSUMED,
            SubscriptionKind::ErrorMonitor => &[Lane::Error],
        }
    }
}

fn reject(report: Result<String, serde_json::Error>, failure: Failure) -> Delivery {
    match report {
        Ok(report) => Delivery::Rejected { failure, report },
        Err(err) => {
            error!("cannot encode error record for {failure}: {err}");
            Delivery::Dropped(failure)
        }
    }
}

fn lane_violation(lane: Lane) -> Failure {
    let message = if lane.is_error() {
        "record on the ERROR lane carries no error details or carries a payload".to_string()
    } else {
        format!("record on the {lane} lane carries error details")
    };
    Failure::new("LaneViolation", message)
}

fn consumer<I, P, F, E>(mut callback: F, mut report: E) -> Handler
where
    I: DeserializeOwned + 'static,
    P: DeserializeOwned + 'static,
    F: FnMut(&Envelope<I, P>, Lane, &mut Outbox) -> Result<(), Failure> + Send + 'static,
    E: FnMut(Option<&Envelope<I, P>>, &Failure, &Record) -> Result<String, serde_json::Error>
        + Send
        + 'static,
{
    Box::new(move |record: &Record, lane: Lane, outbox: &mut Outbox| {
        let mut envelope = match serde_json::from_str::<Envelope<I, P>>(&record.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                let failure = Failure::from(err);
                return reject(report(None, &failure, record), failure);
            }
        };
        envelope.mark_consumed();
        if !envelope.fits_lane(lane) {
            let failure = lane_violation(lane);
            return reject(report(Some(&envelope), &failure, record), failure);
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&envelope, lane, outbox)));
        let failure = match outcome {
            Ok(Ok(())) => return Delivery::Handled,
            Ok(Err(failure)) => failure,
            Err(panic) => Failure::from_panic(panic),
        };
        reject(report(Some(&envelope), &failure, record), failure)
    })
}

fn default_report<I, P>(
    provenance: Arc<Provenance>,
) -> impl FnMut(Option<&Envelope<I, P>>, &Failure, &Record) -> Result<String, serde_json::Error>
where
    I: Serialize,
    P: Serialize,
{
    move |envelope: Option<&Envelope<I, P>>, failure: &Failure, record: &Record| {
        let input = match envelope {
            Some(envelope) => serde_json::to_value(envelope)?,
            None => raw_value(&record.payload),
        };
        let error: Envelope<Value, Value> = Envelope::failed(Some(input), failure.to_error_info());
        serde_json::to_string(&error.stamped(&provenance))
    }
}

/// Publishes, subscribes and polls on behalf of one plugin.
///
/// Owns the single broker connection of the process. Every envelope it sends
/// is stamped with the plugin's provenance.
pub struct BusClient {
    identity: ConnectorIdentity,
    provenance: Arc<Provenance>,
    connection: Box<dyn Connection>,
    poll_timeout: Duration,
    subscriptions: Vec<Subscription>,
    routes: HashMap<String, (usize, Lane)>,
    unsynced: Vec<String>,
    stopped: bool,
}

impl BusClient {
    pub async fn connect(
        transport: &dyn Transport,
        identity: ConnectorIdentity,
        provenance: Provenance,
    ) -> BusResult<Self> {
        let connection = transport.connect(&identity).await?;
        info!(
            "bus client {} joined group {} on {}",
            identity.client_id(),
            identity.group_id(),
            identity.bootstrap_url()
        );
        Ok(Self {
            identity,
            provenance: Arc::new(provenance),
            connection,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            subscriptions: Vec::new(),
            routes: HashMap::new(),
            unsynced: Vec::new(),
            stopped: false,
        })
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn identity(&self) -> &ConnectorIdentity {
        &self.identity
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn ensure_running(&self) -> BusResult<()> {
        if self.stopped {
            Err(BusError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Registers `callback` for the NORMAL and PRIORITY lanes of `topic`.
    ///
    /// Does not block: the connection picks the subscription up on the next
    /// [`poll`](Self::poll). A failing or panicking callback, as well as a
    /// record that does not decode, results in one error envelope on the
    /// ERROR lane of `topic`. Subscribing to the same topic again replaces the
    /// callback.
    pub fn subscribe<I, P, F>(&mut self, topic: &str, callback: F) -> BusResult<()>
    where
        I: Serialize + DeserializeOwned + Send + 'static,
        P: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut(&Envelope<I, P>, Lane, &mut Outbox) -> Result<(), Failure> + Send + 'static,
    {
        self.ensure_running()?;
        let report = default_report::<I, P>(self.provenance.clone());
        self.register(topic, SubscriptionKind::Consumer, consumer(callback, report));
        Ok(())
    }

    /// Like [`subscribe`](Self::subscribe), but on failure the serialized
    /// result of `on_error` is published to the ERROR lane instead of the
    /// default error envelope.
    pub fn subscribe_with<I, P, R, F, H>(
        &mut self,
        topic: &str,
        callback: F,
        mut on_error: H,
    ) -> BusResult<()>
    where
        I: DeserializeOwned + Send + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize,
        F: FnMut(&Envelope<I, P>, Lane, &mut Outbox) -> Result<(), Failure> + Send + 'static,
        H: FnMut(Option<&Envelope<I, P>>, &Failure) -> R + Send + 'static,
    {
        self.ensure_running()?;
        let report = move |envelope: Option<&Envelope<I, P>>, failure: &Failure, _: &Record| {
            serde_json::to_string(&on_error(envelope, failure))
        };
        self.register(topic, SubscriptionKind::Consumer, consumer(callback, report));
        Ok(())
    }

    /// Registers a monitor for the ERROR lane of `topic`.
    ///
    /// Failures of `callback` are logged and never published, so a broken
    /// monitor cannot feed the lane it reads.
    pub fn subscribe_errors<F>(&mut self, topic: &str, mut callback: F) -> BusResult<()>
    where
        F: FnMut(&Envelope<Value, Value>) -> Result<(), Failure> + Send + 'static,
    {
        self.ensure_running()?;
        let handler: Handler = Box::new(move |record: &Record, _: Lane, _: &mut Outbox| {
            let mut envelope = match serde_json::from_str::<Envelope<Value, Value>>(&record.payload)
            {
                Ok(envelope) => envelope,
                Err(err) => return Delivery::Dropped(Failure::from(err)),
            };
            envelope.mark_consumed();
            if !envelope.fits_lane(Lane::Error) {
                return Delivery::Dropped(lane_violation(Lane::Error));
            }
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&envelope))) {
                Ok(Ok(())) => Delivery::Handled,
                Ok(Err(failure)) => Delivery::Dropped(failure),
                Err(panic) => Delivery::Dropped(Failure::from_panic(panic)),
            }
        });
        self.register(topic, SubscriptionKind::ErrorMonitor, handler);
        Ok(())
    }

    fn register(&mut self, topic: &str, kind: SubscriptionKind, handler: Handler) {
        let existing = self
            .subscriptions
            .iter()
            .position(|sub| sub.topic == topic && sub.kind == kind);
        let index = match existing {
            Some(index) => {
                self.subscriptions[index].handler = handler;
                debug!("replaced {kind:?} subscription on {topic}");
                index
            }
            None => {
                self.subscriptions.push(Subscription {
                    topic: topic.to_string(),
                    kind,
                    handler,
                });
                self.subscriptions.len() - 1
            }
        };
        for &lane in kind.lanes() {
            let address = lane.address(topic);
            if self.routes.insert(address.clone(), (index, lane)).is_none() {
                self.unsynced.push(address);
            }
        }
    }

    async fn sync_subscriptions(&mut self) -> BusResult<()> {
        if self.unsynced.is_empty() {
            return Ok(());
        }
        self.connection.subscribe(&self.unsynced).await?;
        debug!("subscribed to {:?}", self.unsynced);
        self.unsynced.clear();
        Ok(())
    }

    /// Wraps `value` in a new envelope and sends it to `lane` of `topic`.
    ///
    /// The ERROR lane is reserved for failures; use
    /// [`publish_error`](Self::publish_error) there.
    pub async fn publish<T>(&mut self, value: &T, topic: &str, lane: Lane) -> BusResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.ensure_running()?;
        let outgoing = encode::<(), T>(&self.provenance, None, value, topic, lane)?;
        self.send(outgoing).await
    }

    /// Sends an envelope carrying `value` whose `input` is `input`.
    pub async fn publish_derived<U, T>(
        &mut self,
        input: &U,
        value: &T,
        topic: &str,
        lane: Lane,
    ) -> BusResult<()>
    where
        U: Serialize + Sync + ?Sized,
        T: Serialize + Sync + ?Sized,
    {
        self.ensure_running()?;
        let outgoing = encode(&self.provenance, Some(input), value, topic, lane)?;
        self.send(outgoing).await
    }

    /// Reports `failure` on the ERROR lane of `topic`.
    pub async fn publish_error<U>(
        &mut self,
        input: &U,
        failure: &Failure,
        topic: &str,
    ) -> BusResult<()>
    where
        U: Serialize + Sync + ?Sized,
    {
        self.ensure_running()?;
        let address = Lane::Error.address(topic);
        let envelope: Envelope<&U, Value> = Envelope::failed(Some(input), failure.to_error_info());
        let payload = serde_json::to_string(&envelope.stamped(&self.provenance)).map_err(
            |source| BusError::Encode {
                address: address.clone(),
                source,
            },
        )?;
        self.send(Outgoing { address, payload }).await
    }

    async fn send(&mut self, outgoing: Outgoing) -> BusResult<()> {
        trace!("sending to {}", outgoing.address);
        self.connection
            .send(&outgoing.address, outgoing.payload)
            .await?;
        Ok(())
    }

    /// Runs one delivery pass and returns the number of records dispatched.
    ///
    /// Ready PRIORITY records are taken without waiting. Only when there are
    /// none does the pass wait, up to the poll timeout, on every subscribed
    /// address. Within one pass PRIORITY records are dispatched first.
    ///
    /// When a send fails midway, the connection is rewound to the record
    /// being dispatched, so a later [`commit`](Self::commit) never covers
    /// records of this pass that were not handled.
    pub async fn poll(&mut self) -> BusResult<usize> {
        self.ensure_running()?;
        self.sync_subscriptions().await?;
        if self.routes.is_empty() {
            tokio::time::sleep(self.poll_timeout).await;
            return Ok(0);
        }

        let priority: Vec<String> = self
            .routes
            .iter()
            .filter(|(_, (_, lane))| *lane == Lane::Priority)
            .map(|(address, _)| address.clone())
            .collect();
        let mut records = if priority.is_empty() {
            Vec::new()
        } else {
            self.connection.fetch(&priority, Duration::ZERO).await?
        };
        if records.is_empty() {
            let all: Vec<String> = self.routes.keys().cloned().collect();
            records = self.connection.fetch(&all, self.poll_timeout).await?;
            records.sort_by_key(|record| {
                !matches!(self.routes.get(&record.address), Some((_, Lane::Priority)))
            });
        }

        for (dispatched, record) in records.iter().enumerate() {
            if let Err(err) = self.dispatch(record).await {
                self.rewind(&records[dispatched..]).await;
                return Err(err);
            }
        }
        Ok(records.len())
    }

    /// Moves each address back to the first of `pending` records it owns.
    async fn rewind(&mut self, pending: &[Record]) {
        let mut firsts: Vec<(&str, u64)> = Vec::new();
        for record in pending {
            match firsts.iter_mut().find(|(address, _)| *address == record.address) {
                Some((_, offset)) => *offset = (*offset).min(record.offset),
                None => firsts.push((record.address.as_str(), record.offset)),
            }
        }
        for (address, offset) in firsts {
            match self.connection.seek(address, offset).await {
                Ok(()) => debug!("rewound {address} to {offset}"),
                Err(err) => error!("cannot rewind {address} to {offset}: {err}"),
            }
        }
    }

    async fn dispatch(&mut self, record: &Record) -> BusResult<()> {
        let Some(&(index, lane)) = self.routes.get(&record.address) else {
            warn!("dropping record from unrouted address {}", record.address);
            return Ok(());
        };
        let mut outbox = Outbox::new(self.provenance.clone());
        let subscription = &mut self.subscriptions[index];
        let delivery = (subscription.handler)(record, lane, &mut outbox);
        let topic = subscription.topic.clone();

        match delivery {
            Delivery::Handled => {
                for outgoing in outbox.pending {
                    self.send(outgoing).await?;
                }
            }
            Delivery::Rejected { failure, report } => {
                warn!(
                    "processing {}@{} failed, reporting on ERROR lane: {failure}",
                    record.address, record.offset
                );
                self.send(Outgoing {
                    address: Lane::Error.address(&topic),
                    payload: report,
                })
                .await?;
            }
            Delivery::Dropped(failure) => {
                warn!(
                    "error record {}@{} could not be handled: {failure}",
                    record.address, record.offset
                );
            }
        }
        Ok(())
    }

    /// Makes the read positions of every dispatched record durable.
    pub async fn commit(&mut self) -> BusResult<()> {
        self.ensure_running()?;
        self.connection.commit().await?;
        Ok(())
    }

    pub async fn send_heartbeat(&mut self) -> BusResult<()> {
        self.ensure_running()?;
        self.connection.heartbeat().await?;
        Ok(())
    }

    /// Releases the connection. Calling it again is a no-op.
    pub async fn stop(&mut self) -> BusResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.connection.close().await?;
        info!("bus client {} stopped", self.identity.client_id());
        Ok(())
    }
}
