//! Connection manager: owns the physical link and drives its lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//!                connect()
//! Disconnected ─────────────► Connecting ──────► Connected
//!      ▲                           │                 │
//!      │      establishment failed ▼                 │ transport closed
//!      │                        Failed               ▼
//!      │                           │           Disconnected
//!      │                           └──── backoff ────┤
//!      └─────────────── disconnect() ◄───────────────┘
//! ```
//!
//! Every failure, whether the attempt never got through or an established
//! link dropped, fails all pending calls with [`LinkError::ConnectionLost`]
//! and schedules a reconnection if the [`ReconnectPolicy`] still allows one.
//!
//! # Locking
//!
//! One mutex guards the link, the attempt counter, the in-flight marker and
//! the reconnect timer, and every state transition is recorded under it.
//! The pending-call table is only ever locked after it. Listeners are
//! notified once the mutex has been released.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::codec::{decode_inbound, encode_request, Inbound, JsonRpcRequest};
use crate::config::ClientConfig;
use crate::endpoint::EndpointResolver;
use crate::error::LinkError;
use crate::pending::{CallOutcome, PendingCallTable};
use crate::reconnect::ReconnectPolicy;
use crate::state::{ConnectionState, StateBroadcaster, Subscription};
use crate::transport::{Connector, FrameSink, FrameStream, Transport};

/// How long the writer waits for the transport to close gracefully.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type Attempt = Shared<BoxFuture<'static, Result<(), LinkError>>>;

/// Marker for the one connection attempt allowed at a time.
struct InFlight {
    attempt: Attempt,
    task: AbortHandle,
}

/// The established link. Dropping it stops the reader and lets the writer
/// close the transport once queued frames are flushed.
struct ActiveLink {
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
    reader: AbortHandle,
}

impl ActiveLink {
    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct Core {
    link: Option<ActiveLink>,
    attempts: u32,
    in_flight: Option<InFlight>,
    /// Bumped by `disconnect()`; attempts and timers from an older epoch
    /// give up instead of touching the link.
    epoch: u64,
    next_link_id: u64,
    reconnect_timer: Option<AbortHandle>,
}

impl Core {
    fn link_open(&self) -> bool {
        self.link.as_ref().is_some_and(ActiveLink::is_open)
    }
}

struct Inner {
    resolver: Arc<dyn EndpointResolver>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    resolve_timeout: Duration,
    connect_timeout: Duration,
    pending: PendingCallTable,
    states: StateBroadcaster,
    core: Mutex<Core>,
}

/// Owner of the single connection to the server.
///
/// Cheap to clone; clones share the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: &ClientConfig,
        resolver: Arc<dyn EndpointResolver>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                connector,
                policy: config.reconnect.clone(),
                resolve_timeout: config.resolve_timeout,
                connect_timeout: config.connect_timeout,
                pending: PendingCallTable::new(config.call_timeout),
                states: StateBroadcaster::new(ConnectionState::Disconnected),
                core: Mutex::new(Core {
                    link: None,
                    attempts: 0,
                    in_flight: None,
                    epoch: 0,
                    next_link_id: 0,
                    reconnect_timer: None,
                }),
            }),
        }
    }

    /// Establish the connection.
    ///
    /// Returns immediately when already connected. When an attempt is
    /// already under way (including one started by automatic reconnection)
    /// this waits for that attempt instead of starting another. An explicit
    /// call re-arms automatic reconnection after `disconnect()` or after the
    /// attempt budget ran out.
    pub async fn connect(&self) -> Result<(), LinkError> {
        let attempt = {
            let mut core = self.inner.core();
            if core.link_open() && self.inner.states.current().is_connected() {
                return Ok(());
            }
            let existing = core.in_flight.as_ref().map(|in_flight| in_flight.attempt.clone());
            match existing {
                Some(attempt) => attempt,
                None => {
                    core.attempts = 0;
                    if let Some(timer) = core.reconnect_timer.take() {
                        timer.abort();
                    }
                    self.inner.begin_attempt(&mut core)
                }
            }
        };
        attempt.await
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Pending calls fail with [`LinkError::ConnectionLost`]; an attempt in
    /// progress is abandoned and its waiters see [`LinkError::Cancelled`].
    ///
    /// Listeners have been told `Disconnected` by the time this returns,
    /// except when another thread is delivering transitions at that moment.
    /// That thread then delivers it after the transitions queued before it,
    /// and this call returns without waiting.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let mut core = inner.core();
        core.epoch += 1;
        core.attempts = inner.policy.max_attempts;
        if let Some(in_flight) = core.in_flight.take() {
            in_flight.task.abort();
        }
        if let Some(timer) = core.reconnect_timer.take() {
            timer.abort();
        }
        let link = core.link.take();
        inner.states.publish(ConnectionState::Disconnected);
        let failed = inner.pending.drain_all(&LinkError::ConnectionLost);
        drop(core);

        if link.is_some() {
            info!(failed, "Disconnected");
        }
        drop(link);
        inner.states.flush();
    }

    /// True when the state is `Connected` and the link can carry frames.
    pub fn is_connected(&self) -> bool {
        self.inner.core().link_open() && self.inner.states.current().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.states.current()
    }

    /// Register a state listener; it is called right away with the current
    /// state and then once per transition.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.states.subscribe(listener)
    }

    /// Reconnection attempts made since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.core().attempts
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.inner.policy
    }

    /// Register a call and queue its frame on the link.
    ///
    /// Nothing is sent and nothing is registered unless the link is up.
    pub(crate) fn submit(
        &self,
        method: &str,
        params: Value,
    ) -> Result<oneshot::Receiver<CallOutcome>, LinkError> {
        let inner = &self.inner;
        let core = inner.core();
        let link = match core.link.as_ref() {
            Some(link) if link.is_open() && inner.states.current().is_connected() => link,
            _ => return Err(LinkError::NotConnected),
        };

        let id = inner.pending.next_id();
        let request = JsonRpcRequest::new(method, params, id.clone())?;
        let frame = encode_request(&request)?;
        let receiver = inner.pending.register(id.clone(), method, request.params)?;

        if link.outbound.send(frame).is_err() {
            inner.pending.cancel(&id);
            return Err(LinkError::ConnectionLost);
        }
        debug!(%id, method, "Request sent");
        Ok(receiver)
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new attempt and record it as in flight. Caller holds the
    /// core lock and has checked that no attempt is running.
    fn begin_attempt(self: &Arc<Self>, core: &mut Core) -> Attempt {
        let epoch = core.epoch;
        let handle = tokio::spawn(Arc::clone(self).establish(epoch));
        let task = handle.abort_handle();

        let attempt = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(LinkError::Cancelled),
                Err(e) => Err(LinkError::ConnectionFailed(format!(
                    "Connection task failed: {}",
                    e
                ))),
            }
        }
        .boxed()
        .shared();

        core.in_flight = Some(InFlight {
            attempt: attempt.clone(),
            task,
        });
        attempt
    }

    async fn establish(self: Arc<Self>, epoch: u64) -> Result<(), LinkError> {
        let endpoint = match timeout(self.resolve_timeout, self.resolver.resolve()).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(e)) => return self.attempt_failed(epoch, e),
            Err(_) => {
                let err = LinkError::ConnectionFailed(format!(
                    "Endpoint not available after {:?}",
                    self.resolve_timeout
                ));
                return self.attempt_failed(epoch, err);
            }
        };

        {
            let core = self.core();
            if core.epoch != epoch {
                return Err(LinkError::Cancelled);
            }
            self.states.publish(ConnectionState::Connecting);
        }
        self.states.flush();
        info!("Connecting to {}", endpoint);

        let transport = match timeout(self.connect_timeout, self.connector.open(&endpoint)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return self.attempt_failed(epoch, e),
            Err(_) => {
                let err = LinkError::ConnectionFailed(format!(
                    "Timed out after {:?} connecting to {}",
                    self.connect_timeout, endpoint
                ));
                return self.attempt_failed(epoch, err);
            }
        };

        {
            let mut core = self.core();
            if core.epoch != epoch {
                return Err(LinkError::Cancelled);
            }
            // A previous link that broke but was not reported yet.
            if core.link.take().is_some() {
                self.pending.drain_all(&LinkError::ConnectionLost);
            }
            let link = self.install(&mut core, transport);
            core.link = Some(link);
            core.attempts = 0;
            core.in_flight = None;
            self.states.publish(ConnectionState::Connected);
        }
        self.states.flush();
        info!("Connected to {}", endpoint);
        Ok(())
    }

    /// Spawn the reader and writer for a freshly opened transport.
    fn install(self: &Arc<Self>, core: &mut Core, transport: Transport) -> ActiveLink {
        core.next_link_id += 1;
        let id = core.next_link_id;
        let Transport { sink, stream } = transport;
        let (outbound, queue) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(Arc::downgrade(self), id, sink, queue));
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(self),
            id,
            self.pending.clone(),
            stream,
        ))
        .abort_handle();

        ActiveLink {
            id,
            outbound,
            reader,
        }
    }

    fn attempt_failed(self: &Arc<Self>, epoch: u64, err: LinkError) -> Result<(), LinkError> {
        {
            let mut core = self.core();
            if core.epoch != epoch {
                return Err(LinkError::Cancelled);
            }
            warn!("Connection attempt failed: {}", err);
            core.in_flight = None;
            self.states.publish(ConnectionState::Failed);
            self.pending.drain_all(&LinkError::ConnectionLost);
            self.schedule_reconnect(&mut core);
        }
        self.states.flush();
        Err(err)
    }

    /// The transport of link `link_id` closed or broke.
    fn connection_lost(self: &Arc<Self>, link_id: u64) {
        let link = {
            let mut core = self.core();
            if !core.link.as_ref().is_some_and(|link| link.id == link_id) {
                return;
            }
            let link = core.link.take();
            warn!("Connection lost");
            self.states.publish(ConnectionState::Disconnected);
            self.pending.drain_all(&LinkError::ConnectionLost);
            self.schedule_reconnect(&mut core);
            link
        };
        drop(link);
        self.states.flush();
    }

    fn schedule_reconnect(self: &Arc<Self>, core: &mut Core) {
        if !self.policy.allows(core.attempts) {
            if core.attempts > 0 {
                warn!(
                    "Giving up after {} reconnection attempts; call connect() to retry",
                    core.attempts
                );
            }
            return;
        }

        core.attempts += 1;
        let attempt = core.attempts;
        let delay = self.policy.delay_for(attempt);
        let epoch = core.epoch;
        let weak = Arc::downgrade(self);
        info!(
            attempt,
            max_attempts = self.policy.max_attempts,
            "Reconnecting in {:?}",
            delay
        );

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect(epoch);
            }
        })
        .abort_handle();
        if let Some(previous) = core.reconnect_timer.replace(timer) {
            previous.abort();
        }
    }

    /// Timer callback: start the scheduled attempt unless something else
    /// already did.
    fn reconnect(self: &Arc<Self>, epoch: u64) {
        let mut core = self.core();
        core.reconnect_timer = None;
        if core.epoch != epoch || core.in_flight.is_some() || core.link_open() {
            return;
        }
        debug!(attempt = core.attempts, "Starting reconnection attempt");
        // The spawned attempt runs on its own; nobody awaits it here.
        let _ = self.begin_attempt(&mut core);
    }
}

/// Drain the outbound queue into the transport.
async fn write_loop(
    inner: Weak<Inner>,
    link_id: u64,
    mut sink: FrameSink,
    mut queue: mpsc::UnboundedReceiver<String>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = sink.send(frame).await {
            error!("Failed to send frame: {}", e);
            queue.close();
            if let Some(inner) = inner.upgrade() {
                inner.connection_lost(link_id);
            }
            return;
        }
    }

    // The link was released.
    if timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
        debug!(link_id, "Transport did not close in time");
    }
}

/// Route inbound frames until the transport closes.
async fn read_loop(
    inner: Weak<Inner>,
    link_id: u64,
    pending: PendingCallTable,
    mut stream: FrameStream,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(frame) => route_inbound(&pending, &frame),
            Err(e) => {
                warn!("Connection error: {}", e);
                break;
            }
        }
    }

    debug!(link_id, "Inbound stream ended");
    if let Some(inner) = inner.upgrade() {
        inner.connection_lost(link_id);
    }
}

/// Hand one inbound frame to its destination. Frames that cannot be
/// correlated are logged and dropped; they never affect the connection.
fn route_inbound(pending: &PendingCallTable, frame: &str) {
    match decode_inbound(frame) {
        Ok(Inbound::Response(response)) => {
            pending.complete(response);
        }
        Ok(Inbound::Invalid { id, reason }) => {
            warn!(%id, "Malformed response: {}", reason);
            pending.fail(&id, LinkError::Protocol(reason));
        }
        Ok(Inbound::Notification { method, .. }) => {
            debug!("Unhandled server notification: {}", method);
        }
        Err(e) => {
            warn!("Dropping inbound frame: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{DeferredEndpoint, StaticEndpoint};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    /// Connector whose transports go nowhere: frames sent are discarded and
    /// the inbound stream never yields.
    struct SilentConnector {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl Connector for SilentConnector {
        async fn open(&self, _endpoint: &Url) -> Result<Transport, LinkError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(Transport::new(
                futures::sink::drain().sink_map_err(|never| match never {}),
                futures::stream::pending(),
            ))
        }
    }

    fn manager(connector: Arc<SilentConnector>) -> ConnectionManager {
        let resolver = Arc::new(StaticEndpoint::parse("ws://localhost:1").unwrap());
        ConnectionManager::new(&ClientConfig::default(), resolver, connector)
    }

    fn silent() -> Arc<SilentConnector> {
        Arc::new(SilentConnector {
            opened: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_submit_requires_connection() {
        let manager = manager(silent());
        assert!(matches!(
            manager.submit("ping", Value::Null),
            Err(LinkError::NotConnected)
        ));
        assert_eq!(manager.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_attempt() {
        let connector = silent();
        let manager = manager(Arc::clone(&connector));

        let (a, b, c) = tokio::join!(manager.connect(), manager.connect(), manager.connect());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected());

        // Idempotent once connected.
        manager.connect().await.unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_submit_registers_pending_call() {
        let manager = manager(silent());
        manager.connect().await.unwrap();

        let _rx = manager.submit("jobs.list", Value::Null).unwrap();
        assert_eq!(manager.pending_calls(), 1);

        manager.disconnect();
        assert_eq!(manager.pending_calls(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(
            manager.submit("jobs.list", Value::Null),
            Err(LinkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_attempt_in_progress() {
        let (resolver, _publisher) = DeferredEndpoint::new();
        let manager = ConnectionManager::new(
            &ClientConfig::default(),
            Arc::new(resolver),
            silent(),
        );

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        while manager.inner.core().in_flight.is_none() {
            tokio::task::yield_now().await;
        }

        manager.disconnect();
        assert!(matches!(waiter.await.unwrap(), Err(LinkError::Cancelled)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_closed_link_is_not_connected_before_loss_is_reported() {
        let manager = manager(silent());
        manager.connect().await.unwrap();
        assert!(manager.is_connected());

        // The writer is gone but nothing has reported the loss yet.
        {
            let mut core = manager.inner.core();
            let link = core.link.as_mut().unwrap();
            let (outbound, queue) = mpsc::unbounded_channel();
            drop(queue);
            link.outbound = outbound;
        }

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(!manager.is_connected());
        assert!(matches!(
            manager.submit("jobs.list", Value::Null),
            Err(LinkError::NotConnected)
        ));
        assert_eq!(manager.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_non_object_params() {
        let manager = manager(silent());
        manager.connect().await.unwrap();
        assert!(matches!(
            manager.submit("jobs.get", serde_json::json!([42])),
            Err(LinkError::Protocol(_))
        ));
        assert_eq!(manager.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_route_inbound_fails_call_with_malformed_response() {
        let pending = PendingCallTable::new(Duration::from_secs(30));
        let id = pending.next_id();
        let rx = pending.register(id, "login", Value::Null).unwrap();

        route_inbound(&pending, r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000}}"#);

        assert!(matches!(
            rx.await.unwrap(),
            Err(LinkError::Protocol(msg)) if msg.contains("Malformed error object")
        ));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_route_inbound_drops_garbage() {
        let pending = PendingCallTable::new(Duration::from_secs(1));
        route_inbound(&pending, "not json");
        route_inbound(&pending, r#"{"jsonrpc":"2.0","method":"jobs.updated","params":{}}"#);
        route_inbound(&pending, r#"{"jsonrpc":"2.0","id":7,"result":null}"#);
        assert!(pending.is_empty());
    }
}
