//! The session facade.
//!
//! `Client` ties the pieces together: configuration, observers, the
//! communicator, the object manager and the invocation director, plus the
//! periodic tick that keeps the clock delta fresh, the connection alive and
//! the proxy cache swept. The facade itself holds no network state beyond
//! ids; everything it learns arrives as downstream messages routed onto the
//! dispatch context.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, info, warn};

use tether_shared::{
    auth_codes, millis_now, ConnectionId, Credentials, DownstreamMessage, FrameError, Oid,
    OutgoingThrottle, PongResponse, Timer, Transport, UpstreamMessage,
};

use crate::connection::worker::spawn_loop;
use crate::connection::{Communicator, CommunicatorHost, LogonConfig, MessageSender};
use crate::delta_calculator::DeltaCalculator;
use crate::dispatch::{DispatchQueue, ThreadDispatcher};
use crate::dobj::DObject;
use crate::dobj_manager::ClientDObjectMgr;
use crate::error::{ClientError, LogonError, ObjectAccessError};
use crate::invocation::{DirectorHost, InvocationDirector};
use crate::observer::{ObserverList, SessionNotice, SessionObserver};
use crate::transport::{Connector, SocketConnector};

/// Tick cadence for the housekeeping loop.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Proxy-cache flush sweep cadence.
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// How long the session may go without an outbound write before a
/// keep-alive ping is owed.
const KEEPALIVE_IDLE_MILLIS: i64 = 60_000;

/// How often an established clock delta is re-estimated.
const RESYNC_MILLIS: i64 = 600_000;

/// Default outbound rate until the server says otherwise.
const DEFAULT_MSGS_PER_SECOND: u32 = 10;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

struct ClientConfig {
    server_host: Option<String>,
    ports: Vec<u16>,
    datagram_ports: Vec<u16>,
    credentials: Option<Credentials>,
    version: String,
}

struct SessionState {
    connection_id: Option<ConnectionId>,
    client_oid: Option<Oid>,
    client_object: Option<Arc<DObject>>,
    bootstrap_payload: Vec<u8>,
    /// Clock sync round in flight, if any.
    delta: Option<DeltaCalculator>,
    /// Wall clock of the last adopted delta, for resync scheduling.
    last_sync: Option<i64>,
    standalone: bool,
    throttle_rate: u32,
    /// A terminal logon failure held until cleanup finishes, so observers
    /// hear it on a clean slate and may retry immediately.
    deferred_failure: Option<LogonError>,
}

/// The handle applications hold. Cheap to clone; all clones share one
/// session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    me: Weak<ClientInner>,
    dispatch: Arc<dyn DispatchQueue>,
    observers: ObserverList,
    throttle: Arc<OutgoingThrottle>,
    comm: Arc<Communicator>,
    manager: Arc<ClientDObjectMgr>,
    director: Arc<InvocationDirector>,
    config: Mutex<ClientConfig>,
    session: Mutex<SessionState>,
    /// Millis to add to local time to approximate server time.
    server_delta: AtomicI64,
    tick_stop: Arc<AtomicBool>,
}

/// The communicator's and director's view of the facade, held weakly so a
/// dropped client tears down without keeping itself alive through its own
/// worker threads.
struct SessionHost {
    inner: Weak<ClientInner>,
}

impl Client {
    pub fn new() -> Self {
        Self::with_parts(Arc::new(ThreadDispatcher::new()), Arc::new(SocketConnector))
    }

    /// Builds a client on a caller-supplied dispatch context and transport.
    pub fn with_parts(dispatch: Arc<dyn DispatchQueue>, connector: Arc<dyn Connector>) -> Self {
        let throttle = Arc::new(OutgoingThrottle::new(
            DEFAULT_MSGS_PER_SECOND,
            Duration::from_secs(1),
        ));
        let inner = Arc::new_cyclic(|me: &Weak<ClientInner>| {
            let host = Arc::new(SessionHost { inner: me.clone() });
            let comm = Communicator::new(host.clone(), connector, throttle.clone());
            let manager = ClientDObjectMgr::new(
                comm.clone() as Arc<dyn MessageSender>,
                dispatch.clone(),
            );
            let director = InvocationDirector::new(manager.clone(), host);
            ClientInner {
                me: me.clone(),
                dispatch: dispatch.clone(),
                observers: ObserverList::new(),
                throttle,
                comm,
                manager,
                director,
                config: Mutex::new(ClientConfig {
                    server_host: None,
                    ports: Vec::new(),
                    datagram_ports: Vec::new(),
                    credentials: None,
                    version: String::new(),
                }),
                session: Mutex::new(SessionState {
                    connection_id: None,
                    client_oid: None,
                    client_object: None,
                    bootstrap_payload: Vec::new(),
                    delta: None,
                    last_sync: None,
                    standalone: false,
                    throttle_rate: DEFAULT_MSGS_PER_SECOND,
                    deferred_failure: None,
                }),
                server_delta: AtomicI64::new(0),
                tick_stop: Arc::new(AtomicBool::new(true)),
            }
        });
        Self { inner }
    }

    // ===== configuration =====

    pub fn set_server(
        &self,
        host: impl Into<String>,
        ports: Vec<u16>,
        datagram_ports: Vec<u16>,
    ) {
        let mut config = self.inner.config();
        config.server_host = Some(host.into());
        config.ports = ports;
        config.datagram_ports = datagram_ports;
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        self.inner.config().credentials = Some(credentials);
    }

    pub fn set_version(&self, version: impl Into<String>) {
        self.inner.config().version = version.into();
    }

    /// Marks the session standalone: no network, driven entirely by
    /// locally injected messages.
    pub fn set_standalone(&self, standalone: bool) {
        self.inner.session().standalone = standalone;
    }

    // ===== observers =====

    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.inner.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn SessionObserver>) {
        self.inner.observers.remove(observer);
    }

    // ===== session control =====

    /// Starts a logon attempt. Progress and outcome arrive through
    /// observers; only local misconfiguration is reported here.
    pub fn logon(&self) -> Result<(), ClientError> {
        let logon_config = {
            let config = self.inner.config();
            let host = config.server_host.clone().ok_or(ClientError::MissingServer)?;
            let credentials = config
                .credentials
                .clone()
                .ok_or(ClientError::MissingCredentials)?;
            LogonConfig {
                host,
                ports: config.ports.clone(),
                datagram_ports: config.datagram_ports.clone(),
                credentials,
                version: config.version.clone(),
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            }
        };
        if logon_config.ports.is_empty() {
            return Err(ClientError::MissingServer);
        }

        self.inner.comm.logon(logon_config)?;
        // posted, not called in place: any failure notification from the
        // nascent reader thread also goes through the dispatch queue, so
        // observers always hear WillLogon first
        let notifier = self.inner.clone();
        self.inner.dispatch.post(Box::new(move || {
            notifier.notify(&SessionNotice::WillLogon);
        }));
        self.inner.start_tick();
        Ok(())
    }

    /// Requests logoff. With `abortable` set, observers may veto; returns
    /// whether the logoff is proceeding. Idempotent once disconnected.
    pub fn logoff(&self, abortable: bool) -> bool {
        if abortable && self.inner.observers.poll_will_logoff(self) {
            info!("Logoff vetoed by an observer.");
            return false;
        }
        if self.inner.session().standalone {
            self.standalone_logoff();
            return true;
        }
        self.inner.comm.logoff();
        true
    }

    /// Ends a standalone session: the full cleanup and notification
    /// sequence with no communicator involved.
    pub fn standalone_logoff(&self) {
        self.inner.session_ended();
    }

    /// Injects a downstream message as though it had arrived on the wire.
    /// This is the standalone session's delivery path.
    pub fn deliver_local(&self, message: DownstreamMessage) {
        self.inner.process_message(message);
    }

    // ===== session queries =====

    pub fn is_logged_on(&self) -> bool {
        self.inner.session().client_object.is_some()
    }

    pub fn client_object(&self) -> Option<Arc<DObject>> {
        self.inner.session().client_object.clone()
    }

    pub fn client_oid(&self) -> Option<Oid> {
        self.inner.session().client_oid
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.session().connection_id
    }

    pub fn bootstrap_payload(&self) -> Vec<u8> {
        self.inner.session().bootstrap_payload.clone()
    }

    /// The server-granted outbound message rate currently in force.
    pub fn outgoing_rate(&self) -> u32 {
        self.inner.session().throttle_rate
    }

    // ===== server time =====

    /// Millis to add to a local reading to approximate the server clock.
    pub fn server_delta(&self) -> i64 {
        self.inner.server_delta.load(Ordering::SeqCst)
    }

    pub fn to_server_time(&self, stamp: i64) -> i64 {
        stamp + self.server_delta()
    }

    pub fn from_server_time(&self, stamp: i64) -> i64 {
        stamp - self.server_delta()
    }

    // ===== collaborators =====

    pub fn dobj_manager(&self) -> Arc<ClientDObjectMgr> {
        self.inner.manager.clone()
    }

    pub fn invocation_director(&self) -> Arc<InvocationDirector> {
        self.inner.director.clone()
    }

    pub fn dispatch(&self) -> Arc<dyn DispatchQueue> {
        self.inner.dispatch.clone()
    }

    pub fn register_flush_delay(&self, category_prefix: impl Into<String>, delay: Duration) {
        self.inner.manager.register_flush_delay(category_prefix, delay);
    }

    /// The application learned (through its own traffic) that the session's
    /// client object is moving to a new oid.
    pub fn client_object_did_change(&self, new_oid: Oid) {
        self.inner.director.client_object_will_change(new_oid);
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientInner {
    fn client(self: &Arc<Self>) -> Client {
        Client {
            inner: self.clone(),
        }
    }

    fn notify(self: &Arc<Self>, notice: &SessionNotice) {
        self.observers.notify(&self.client(), notice);
    }

    fn config(&self) -> MutexGuard<'_, ClientConfig> {
        self.config
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn session(&self) -> MutexGuard<'_, SessionState> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ===== inbound routing (dispatch context) =====

    fn process_message(self: &Arc<Self>, message: DownstreamMessage) {
        let inner = self.clone();
        self.dispatch
            .post(Box::new(move || inner.route_message(message)));
    }

    /// Runs as one job on the dispatch context and resolves the message
    /// completely, notifications included, so messages take effect in
    /// arrival order relative to each other and to teardown.
    fn route_message(self: &Arc<Self>, message: DownstreamMessage) {
        match message {
            DownstreamMessage::Bootstrap {
                connection_id,
                client_oid,
                payload,
            } => self.got_bootstrap(connection_id, client_oid, payload),
            DownstreamMessage::Pong(pong) => self.got_pong(&pong),
            DownstreamMessage::Event { event } => self.manager.got_event(event),
            DownstreamMessage::ObjectResponse { object } => {
                self.manager.got_object_response(object)
            }
            DownstreamMessage::UnsubscribeResponse { oid } => {
                self.manager.got_unsubscribe_response(oid)
            }
            DownstreamMessage::FailureResponse { oid, reason } => {
                self.manager.got_failure_response(oid, reason)
            }
            DownstreamMessage::ThrottleUpdated { messages_per_sec } => {
                info!("Outbound rate updated [rate={messages_per_sec}/s].");
                self.session().throttle_rate = messages_per_sec;
                // in standalone there is no communicator applying it
                self.throttle.update_rate(messages_per_sec);
            }
            other @ (DownstreamMessage::SecureResponse { .. }
            | DownstreamMessage::AuthResponse { .. }) => {
                warn!("Dropping handshake message received mid-session [message={other:?}].");
            }
        }
    }

    /// Session startup data. Records ids, kicks off clock sync and hands
    /// the reins to the invocation director; logon completes when the
    /// client object arrives.
    fn got_bootstrap(self: &Arc<Self>, connection_id: ConnectionId, client_oid: Oid, payload: Vec<u8>) {
        debug!("Got bootstrap [conn_id={connection_id}, cloid={client_oid}].");
        {
            let mut session = self.session();
            session.connection_id = Some(connection_id);
            session.client_oid = Some(client_oid);
            session.bootstrap_payload = payload;
        }
        self.start_delta_round();
        self.director.init(client_oid);
    }

    /// Feeds a pong into the running clock-sync round. A pong with no
    /// round in flight is a straggler from a cancelled round or a datagram
    /// probe; tolerated silently.
    fn got_pong(self: &Arc<Self>, pong: &PongResponse) {
        let mut session = self.session();
        let Some(calculator) = session.delta.as_mut() else {
            debug!("Dropping errant pong.");
            return;
        };
        calculator.pong_received(pong);
        // every pong refines the published delta; a half-finished round
        // still beats no offset at all
        let delta = calculator.time_delta();
        if calculator.done() {
            session.delta = None;
            session.last_sync = Some(millis_now());
            drop(session);
            self.server_delta.store(delta, Ordering::SeqCst);
            debug!("Clock delta established [delta={delta}ms].");
        } else {
            calculator.sent_ping(millis_now());
            drop(session);
            self.server_delta.store(delta, Ordering::SeqCst);
            self.send_ping();
        }
    }

    fn start_delta_round(self: &Arc<Self>) {
        {
            let mut session = self.session();
            if session.delta.is_some() {
                return;
            }
            let mut calculator = DeltaCalculator::new();
            calculator.sent_ping(millis_now());
            session.delta = Some(calculator);
        }
        self.send_ping();
    }

    fn send_ping(&self) {
        self.comm.send(UpstreamMessage::Ping, Transport::default());
    }

    // ===== director host duties =====

    fn adopt_client_object(self: &Arc<Self>, object: &Arc<DObject>, fresh: bool) {
        self.session().client_object = Some(object.clone());
        if fresh {
            info!("Logged on [cloid={}].", object.oid());
            self.notify(&SessionNotice::DidLogon);
        } else {
            self.notify(&SessionNotice::ObjectChanged);
        }
    }

    // ===== teardown =====

    /// Runs the full end-of-session sequence as one job on the dispatch
    /// context: collaborator cleanup, then the notification train on a
    /// clean slate. One job keeps it ordered behind every message that
    /// arrived before the close, and ahead of nothing that arrived after.
    fn session_ended(self: &Arc<Self>) {
        let inner = self.clone();
        self.dispatch.post(Box::new(move || {
            inner.tick_stop.store(true, Ordering::SeqCst);
            let (was_logged_on, deferred) = {
                let mut session = inner.session();
                let was_logged_on = session.client_object.take().is_some();
                session.connection_id = None;
                session.client_oid = None;
                session.bootstrap_payload = Vec::new();
                session.delta = None;
                session.last_sync = None;
                session.throttle_rate = DEFAULT_MSGS_PER_SECOND;
                (was_logged_on, session.deferred_failure.take())
            };
            inner.server_delta.store(0, Ordering::SeqCst);
            inner.manager.cleanup();
            inner.director.cleanup();

            if was_logged_on {
                inner.notify(&SessionNotice::DidLogoff);
            }
            inner.notify(&SessionNotice::DidClear);
            if let Some(cause) = deferred {
                inner.notify(&SessionNotice::FailedToLogon { cause });
            }
        }));
    }

    // ===== housekeeping tick =====

    fn start_tick(self: &Arc<Self>) {
        self.tick_stop.store(false, Ordering::SeqCst);
        let stop = self.tick_stop.clone();
        let inner = self.clone();
        let mut flush_timer = Timer::new(FLUSH_INTERVAL);
        spawn_loop(
            "tether-tick",
            move || {
                std::thread::sleep(TICK_INTERVAL);
                if stop.load(Ordering::SeqCst) {
                    return false;
                }
                inner.tick(&mut flush_timer);
                true
            },
            || {},
        );
    }

    fn tick(self: &Arc<Self>, flush_timer: &mut Timer) {
        if !self.comm.is_live() {
            return;
        }

        // begin a resync round when the last estimate has gone stale
        let resync_due = {
            let session = self.session();
            session.delta.is_none()
                && session
                    .last_sync
                    .map(|stamp| millis_now() - stamp >= RESYNC_MILLIS)
                    .unwrap_or(false)
        };
        if resync_due {
            debug!("Clock delta stale; resyncing.");
            self.start_delta_round();
        }

        // a quiet line still needs to look alive to the server
        let last_write = self.comm.last_write();
        if last_write > 0 && millis_now() - last_write >= KEEPALIVE_IDLE_MILLIS {
            debug!("Sending keep-alive ping.");
            self.send_ping();
        }

        if flush_timer.ringing() {
            flush_timer.reset();
            self.manager.sweep();
        }
    }
}

impl CommunicatorHost for SessionHost {
    fn process_message(&self, message: DownstreamMessage) {
        if let Some(inner) = self.inner.upgrade() {
            inner.process_message(message);
        }
    }

    fn logon_failed(&self, cause: LogonError) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if cause.still_in_progress {
            // a tribulation, not an outcome: the attempt continues
            let notifier = inner.clone();
            inner.dispatch.post(Box::new(move || {
                notifier.notify(&SessionNotice::FailedToLogon { cause });
            }));
        } else {
            inner.session().deferred_failure = Some(cause);
        }
    }

    fn connection_failed(&self, cause: FrameError) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let notifier = inner.clone();
        inner.dispatch.post(Box::new(move || {
            notifier.notify(&SessionNotice::ConnectionFailed {
                cause: cause.to_string(),
            });
        }));
    }

    fn connection_closed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.session_ended();
        }
    }
}

impl DirectorHost for SessionHost {
    fn got_client_object(&self, object: &Arc<DObject>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.adopt_client_object(object, true);
        }
    }

    fn client_object_changed(&self, object: &Arc<DObject>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.adopt_client_object(object, false);
        }
    }

    fn client_object_failed(&self, cause: &ObjectAccessError) {
        // a connection-closed failure is the teardown itself reaching the
        // director's pending subscription; nothing more to do
        if matches!(cause, ObjectAccessError::ConnectionClosed { .. }) {
            return;
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        // without the client object the session cannot finish logging on
        inner.session().deferred_failure =
            Some(LogonError::terminal(auth_codes::SERVER_ERROR));
        warn!("Aborting session without client object [cause={cause}].");
        inner.comm.logoff();
    }
}
