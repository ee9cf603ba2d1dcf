//! The session state machine.
//!
//! A session walks Idle → Connecting → (SecureHandshake) → Authenticating →
//! Authenticated → Live → LoggingOff → Closed. The handshake runs
//! synchronously on the reader thread; once authenticated the reader becomes
//! the message pump, a writer thread drains the outbound queue, and (when
//! datagram ports are configured) a probe thread attempts the datagram
//! upgrade and becomes two more workers on success. The last worker out
//! closes the channel and reports the close to the host.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use tether_shared::{
    auth_codes, millis_now, session_key, ConnectionId, DatagramCodec, DatagramSequencer,
    DownstreamMessage, FrameError, FrameReader, FrameWriter, OutgoingThrottle, Transport,
    UpstreamMessage,
};

use crate::error::{ClientError, LogonError};
use crate::transport::{Connector, PacketPair, StreamPair};

use super::worker::spawn_loop;
use super::MessageSender;

/// Datagram probes sent per candidate port before moving on.
const DATAGRAM_PROBE_ATTEMPTS: usize = 3;

/// How long one probe waits for a verified reply.
const DATAGRAM_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Poll interval for the datagram writer's shutdown check.
const DATAGRAM_WRITE_POLL: Duration = Duration::from_millis(500);

/// Everything a logon attempt needs, captured at `logon()` time so later
/// facade reconfiguration cannot affect an attempt in flight.
#[derive(Clone)]
pub struct LogonConfig {
    pub host: String,
    pub ports: Vec<u16>,
    pub datagram_ports: Vec<u16>,
    pub credentials: tether_shared::Credentials,
    pub version: String,
    pub connect_timeout: Duration,
}

/// The session-side consumer of communicator activity. Calls arrive on
/// worker threads; the host forwards onto the dispatch context.
pub trait CommunicatorHost: Send + Sync + 'static {
    /// A decoded downstream message, reliable or datagram.
    fn process_message(&self, message: DownstreamMessage);

    /// The logon attempt failed. May fire more than once with
    /// `still_in_progress` set; fires at most once terminally.
    fn logon_failed(&self, cause: LogonError);

    /// The connection broke after the session went live. Reported once;
    /// `connection_closed` still follows when the workers finish.
    fn connection_failed(&self, cause: FrameError);

    /// Every worker has exited and the channel is closed. Fires exactly
    /// once per logon attempt, success or failure.
    fn connection_closed(&self);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Idle,
    LoggingOn,
    Live,
}

enum WriterCommand {
    Deliver(UpstreamMessage),
    Shutdown,
}

/// Outcome of one port's handshake attempt.
enum PortFailure {
    /// The channel could not be carried through on this port; the next
    /// candidate may fare better.
    Channel(FrameError),
    /// The server answered with a refusal; no other port will change it.
    Terminal(LogonError),
}

/// The stream halves of an authenticated connection, handed from the
/// handshake to the pump.
struct Established {
    reader: Box<dyn Read + Send>,
    frames: FrameReader,
    writer: Box<dyn Write + Send>,
    secret: Vec<u8>,
}

struct CommState {
    phase: Phase,
    writer_tx: Option<Sender<WriterCommand>>,
    datagram_tx: Option<Sender<UpstreamMessage>>,
    datagram_stop: Option<Arc<AtomicBool>>,
    closer: Option<Arc<dyn Fn() + Send + Sync>>,
    open_workers: u32,
    logoff_requested: bool,
    failure_reported: bool,
    /// Wall clock of the last successful reliable write, for keep-alive
    /// decisions in the facade.
    last_write: i64,
}

/// Owns the network side of one session at a time.
pub struct Communicator {
    host: Arc<dyn CommunicatorHost>,
    connector: Arc<dyn Connector>,
    throttle: Arc<OutgoingThrottle>,
    state: Mutex<CommState>,
}

impl Communicator {
    pub fn new(
        host: Arc<dyn CommunicatorHost>,
        connector: Arc<dyn Connector>,
        throttle: Arc<OutgoingThrottle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            connector,
            throttle,
            state: Mutex::new(CommState {
                phase: Phase::Idle,
                writer_tx: None,
                datagram_tx: None,
                datagram_stop: None,
                closer: None,
                open_workers: 0,
                logoff_requested: false,
                failure_reported: false,
                last_write: 0,
            }),
        })
    }

    /// Starts a logon attempt on a fresh reader thread. Fails fast if a
    /// session is already connecting or connected.
    pub fn logon(self: &Arc<Self>, config: LogonConfig) -> Result<(), ClientError> {
        {
            let mut state = self.lock();
            if state.phase != Phase::Idle {
                return Err(ClientError::AlreadyConnected);
            }
            state.phase = Phase::LoggingOn;
            state.logoff_requested = false;
            state.failure_reported = false;
            state.open_workers = 1;
        }

        let comm = self.clone();
        let mut job = Some(config);
        let exit_comm = self.clone();
        spawn_loop(
            "tether-reader",
            move || {
                if let Some(config) = job.take() {
                    comm.run_session(config);
                }
                false
            },
            move || exit_comm.worker_exited(),
        );
        Ok(())
    }

    /// Requests an orderly end of session. Idempotent; safe to call with no
    /// session open.
    pub fn logoff(&self) {
        let mut state = self.lock();
        if state.phase == Phase::Idle || state.logoff_requested {
            return;
        }
        state.logoff_requested = true;
        if let Some(stop) = &state.datagram_stop {
            stop.store(true, Ordering::SeqCst);
        }
        match &state.writer_tx {
            Some(tx) => {
                // the writer drains everything already queued, then the
                // logoff, then closes the channel on its way out
                let _ = tx.send(WriterCommand::Deliver(UpstreamMessage::Logoff));
                let _ = tx.send(WriterCommand::Shutdown);
            }
            None => {
                // still mid-handshake: abort by closing the socket under
                // the reader thread
                if let Some(closer) = &state.closer {
                    closer();
                }
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().phase != Phase::Idle
    }

    pub fn is_live(&self) -> bool {
        self.lock().phase == Phase::Live
    }

    /// Wall clock (millis) of the last successful reliable write; zero
    /// before the first write of the current session.
    pub fn last_write(&self) -> i64 {
        self.lock().last_write
    }

    // ===== reader thread =====

    fn run_session(self: &Arc<Self>, config: LogonConfig) {
        match self.establish(&config) {
            // a logoff can land at any point of the handshake, including
            // after auth succeeded but before the pump starts
            Ok(established) => {
                if self.lock().logoff_requested {
                    debug!("Logon aborted.");
                    drop(established);
                } else {
                    self.pump(established, &config);
                }
            }
            Err(cause) => {
                if self.lock().logoff_requested {
                    debug!("Logon aborted.");
                } else {
                    self.host.logon_failed(cause);
                }
            }
        }
        self.shutdown_channels();
    }

    /// Walks the configured ports until one carries the handshake through
    /// auth, reporting a non-terminal tribulation between candidates.
    fn establish(&self, config: &LogonConfig) -> Result<Established, LogonError> {
        let count = config.ports.len();
        for (index, port) in config.ports.iter().enumerate() {
            match self.try_port(config, *port) {
                Ok(established) => return Ok(established),
                Err(PortFailure::Terminal(cause)) => return Err(cause),
                Err(PortFailure::Channel(cause)) => {
                    // a logoff issued while this port was connecting (even
                    // before the socket existed) abandons the walk
                    if self.lock().logoff_requested {
                        debug!("Abandoning port walk [port={port}, cause={cause}].");
                        return Err(LogonError::terminal(auth_codes::NETWORK_ERROR));
                    }
                    if index + 1 < count {
                        info!(
                            "Connection failed, trying next port [port={port}, cause={cause}]."
                        );
                        self.host
                            .logon_failed(LogonError::transient(auth_codes::TRYING_NEXT_PORT));
                    } else {
                        warn!("Connection failed [port={port}, cause={cause}].");
                        return Err(LogonError::terminal(auth_codes::NETWORK_ERROR));
                    }
                }
            }
        }
        Err(LogonError::terminal(auth_codes::NETWORK_ERROR))
    }

    /// One port's worth of handshake: connect, optional secure exchange,
    /// auth. Ends with the connection authenticated but not yet live.
    fn try_port(&self, config: &LogonConfig, port: u16) -> Result<Established, PortFailure> {
        let StreamPair {
            mut reader,
            mut writer,
            closer,
        } = self
            .connector
            .connect(&config.host, port, config.connect_timeout)
            .map_err(|cause| PortFailure::Channel(FrameError::Io(cause)))?;
        self.lock().closer = Some(Arc::from(closer));

        let mut frames = FrameReader::new();
        let mut frame_writer = FrameWriter::new();

        let mut secret = Vec::new();
        if config.credentials.requires_secure() {
            let key = session_key();
            frame_writer
                .write_message(
                    &mut writer,
                    &UpstreamMessage::SecureRequest {
                        client_key: key.clone(),
                    },
                )
                .map_err(PortFailure::Channel)?;
            match read_message(&mut frames, &mut reader).map_err(PortFailure::Channel)? {
                DownstreamMessage::SecureResponse {
                    server_key: Some(_),
                } => secret = key,
                DownstreamMessage::SecureResponse { server_key: None } => {
                    debug!("Server declined the secure channel; using plain auth.");
                }
                other => return Err(unexpected_handshake_message(&other)),
            }
        }

        frame_writer
            .write_message(
                &mut writer,
                &UpstreamMessage::AuthRequest {
                    credentials: config.credentials.clone(),
                    version: config.version.clone(),
                    secret: if secret.is_empty() {
                        None
                    } else {
                        Some(secret.clone())
                    },
                },
            )
            .map_err(PortFailure::Channel)?;
        match read_message(&mut frames, &mut reader).map_err(PortFailure::Channel)? {
            DownstreamMessage::AuthResponse { data } => {
                if !data.is_success() {
                    info!("Authentication refused [code={}].", data.code);
                    return Err(PortFailure::Terminal(LogonError::terminal(data.code)));
                }
            }
            other => return Err(unexpected_handshake_message(&other)),
        }

        Ok(Established {
            reader,
            frames,
            writer,
            secret,
        })
    }

    /// The post-auth message pump. Runs on the reader thread until logoff
    /// or failure.
    fn pump(self: &Arc<Self>, established: Established, config: &LogonConfig) {
        let Established {
            mut reader,
            mut frames,
            writer,
            secret,
        } = established;
        self.start_writer(writer);

        loop {
            let message = match frames
                .read_frame(&mut reader)
                .and_then(|frame| tether_shared::decode_downstream(&frame, millis_now()))
            {
                Ok(message) => message,
                Err(cause) => {
                    self.connection_broke(cause);
                    return;
                }
            };

            match message {
                DownstreamMessage::Bootstrap { connection_id, .. } => {
                    let already_live = {
                        let mut state = self.lock();
                        let already = state.phase == Phase::Live;
                        state.phase = Phase::Live;
                        already
                    };
                    if already_live {
                        warn!("Ignoring repeated bootstrap [conn_id={connection_id}].");
                        continue;
                    }
                    if !config.datagram_ports.is_empty() {
                        self.start_datagram_upgrade(
                            config.host.clone(),
                            config.datagram_ports.clone(),
                            connection_id,
                            secret.clone(),
                        );
                    }
                    self.host.process_message(message);
                }
                DownstreamMessage::ThrottleUpdated { messages_per_sec } => {
                    debug!("Applying throttle update [rate={messages_per_sec}/s].");
                    self.throttle.update_rate(messages_per_sec);
                    self.host.process_message(message);
                }
                other => self.host.process_message(other),
            }
        }
    }

    /// Classifies and reports a broken connection exactly once. A break
    /// after a requested logoff is the expected close, not a failure.
    fn connection_broke(&self, cause: FrameError) {
        let live = {
            let mut state = self.lock();
            if state.logoff_requested || state.failure_reported {
                debug!("Channel closed [cause={cause}].");
                return;
            }
            state.failure_reported = true;
            state.phase == Phase::Live
        };
        if cause.is_clean_close() {
            info!("Server closed the connection.");
        } else {
            warn!("Connection failed [cause={cause}].");
        }
        if live {
            self.host.connection_failed(cause);
        } else {
            self.host.logon_failed(LogonError::terminal(auth_codes::NETWORK_ERROR));
        }
    }

    // ===== writer thread =====

    fn start_writer(self: &Arc<Self>, writer: Box<dyn Write + Send>) {
        let (tx, rx) = channel();
        {
            let mut state = self.lock();
            state.writer_tx = Some(tx);
            state.open_workers += 1;
        }

        let comm = self.clone();
        let mut writer = writer;
        let mut frame_writer = FrameWriter::new();
        let exit_comm = self.clone();
        spawn_loop(
            "tether-writer",
            move || match rx.recv() {
                Ok(WriterCommand::Deliver(message)) => {
                    comm.throttle.acquire();
                    match frame_writer.write_message(&mut writer, &message) {
                        Ok(()) => {
                            comm.lock().last_write = millis_now();
                            true
                        }
                        Err(cause) => {
                            comm.connection_broke(cause);
                            false
                        }
                    }
                }
                Ok(WriterCommand::Shutdown) | Err(_) => false,
            },
            move || {
                // the writer going away always wakes the reader: either the
                // queue drained after logoff or the write path failed
                exit_comm.close_channel();
                exit_comm.worker_exited();
            },
        );
    }

    // ===== datagram workers =====

    fn start_datagram_upgrade(
        self: &Arc<Self>,
        host: String,
        ports: Vec<u16>,
        connection_id: ConnectionId,
        secret: Vec<u8>,
    ) {
        let stop = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.lock();
            state.datagram_stop = Some(stop.clone());
            state.open_workers += 1;
        }

        let comm = self.clone();
        let mut job = Some((host, ports, secret, stop));
        let exit_comm = self.clone();
        spawn_loop(
            "tether-datagram",
            move || {
                if let Some((host, ports, secret, stop)) = job.take() {
                    comm.run_datagram_upgrade(host, ports, connection_id, secret, stop);
                }
                false
            },
            move || exit_comm.worker_exited(),
        );
    }

    /// Probes the candidate datagram ports in order; the first port whose
    /// probe draws a verified reply wins. Exhaustion is not fatal; the
    /// session simply stays reliable-only. Interruption is terminal: a
    /// cancelled upgrade is never resumed.
    fn run_datagram_upgrade(
        self: &Arc<Self>,
        host: String,
        ports: Vec<u16>,
        connection_id: ConnectionId,
        secret: Vec<u8>,
        stop: Arc<AtomicBool>,
    ) {
        let codec = Arc::new(DatagramCodec::new(connection_id, secret));
        let sequencer = Arc::new(Mutex::new(DatagramSequencer::new()));

        for port in ports {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            let pair = match self.connector.open_packet_channel(&host, port) {
                Ok(pair) => pair,
                Err(cause) => {
                    debug!("Datagram channel refused [port={port}, cause={cause}].");
                    continue;
                }
            };
            if let Some(pair) = self.probe_port(pair, &codec, &sequencer, &stop) {
                info!("Datagram channel established [port={port}].");
                self.send(
                    UpstreamMessage::TransmitDatagrams { connection_id },
                    Transport::ReliableOrdered,
                );
                self.start_datagram_workers(pair, codec, sequencer, stop);
                return;
            }
        }
        if !stop.load(Ordering::SeqCst) {
            info!("Datagram upgrade failed on all candidate ports; staying reliable-only.");
        }
    }

    fn probe_port(
        &self,
        mut pair: PacketPair,
        codec: &DatagramCodec,
        sequencer: &Mutex<DatagramSequencer>,
        stop: &AtomicBool,
    ) -> Option<PacketPair> {
        let mut buf = [0u8; 2048];
        for _ in 0..DATAGRAM_PROBE_ATTEMPTS {
            if stop.load(Ordering::SeqCst) {
                return None;
            }
            let payload = lock_sequencer(sequencer).write_datagram(&UpstreamMessage::Ping);
            let packet = codec.encode(&payload).ok()?;
            if let Err(cause) = pair.sender.send(&packet) {
                debug!("Datagram probe send failed [cause={cause}].");
                return None;
            }

            let deadline = Instant::now() + DATAGRAM_PROBE_TIMEOUT;
            while Instant::now() < deadline {
                if stop.load(Ordering::SeqCst) {
                    return None;
                }
                match pair.receiver.receive(&mut buf) {
                    Ok(len) => match codec.decode(&buf[..len]) {
                        Some(payload) => {
                            // the reply both confirms the channel and is a
                            // real message; deliver it
                            if let Ok(Some(message)) =
                                lock_sequencer(sequencer).read_datagram(payload, millis_now())
                            {
                                self.host.process_message(message);
                            }
                            return Some(pair);
                        }
                        None => lock_sequencer(sequencer).note_failed(),
                    },
                    Err(cause) if is_timeout(&cause) => {}
                    Err(cause) => {
                        debug!("Datagram probe receive failed [cause={cause}].");
                        return None;
                    }
                }
            }
        }
        None
    }

    fn start_datagram_workers(
        self: &Arc<Self>,
        pair: PacketPair,
        codec: Arc<DatagramCodec>,
        sequencer: Arc<Mutex<DatagramSequencer>>,
        stop: Arc<AtomicBool>,
    ) {
        let (tx, rx) = channel::<UpstreamMessage>();
        {
            let mut state = self.lock();
            state.datagram_tx = Some(tx);
            state.open_workers += 2;
        }
        let PacketPair {
            mut sender,
            mut receiver,
        } = pair;

        let comm = self.clone();
        let write_codec = codec.clone();
        let write_sequencer = sequencer.clone();
        let write_stop = stop.clone();
        let exit_comm = self.clone();
        spawn_loop(
            "tether-datagram-writer",
            move || match rx.recv_timeout(DATAGRAM_WRITE_POLL) {
                Ok(message) => {
                    if write_stop.load(Ordering::SeqCst) {
                        return false;
                    }
                    // datagrams are best effort: when throttled, drop
                    // instead of queueing latency
                    if !comm.throttle.try_acquire() {
                        debug!("Dropping throttled datagram.");
                        return true;
                    }
                    let payload = lock_sequencer(&write_sequencer).write_datagram(&message);
                    if let Ok(packet) = write_codec.encode(&payload) {
                        if let Err(cause) = sender.send(&packet) {
                            debug!("Datagram send failed [cause={cause}].");
                        }
                    }
                    true
                }
                Err(RecvTimeoutError::Timeout) => !write_stop.load(Ordering::SeqCst),
                Err(RecvTimeoutError::Disconnected) => false,
            },
            move || exit_comm.worker_exited(),
        );

        let comm = self.clone();
        let exit_comm = self.clone();
        let mut buf = vec![0u8; 2048];
        spawn_loop(
            "tether-datagram-reader",
            move || match receiver.receive(&mut buf) {
                Ok(len) => {
                    comm.process_datagram(&codec, &sequencer, &buf[..len]);
                    !stop.load(Ordering::SeqCst)
                }
                Err(cause) if is_timeout(&cause) => !stop.load(Ordering::SeqCst),
                Err(cause) => {
                    debug!("Datagram channel read failed [cause={cause}].");
                    false
                }
            },
            move || exit_comm.worker_exited(),
        );
    }

    /// Verification or sequencing rejections are counted and skipped, never
    /// surfaced as errors.
    fn process_datagram(
        &self,
        codec: &DatagramCodec,
        sequencer: &Mutex<DatagramSequencer>,
        packet: &[u8],
    ) {
        match codec.decode(packet) {
            Some(payload) => match lock_sequencer(sequencer).read_datagram(payload, millis_now())
            {
                Ok(Some(message)) => self.host.process_message(message),
                Ok(None) => {}
                Err(cause) => debug!("Dropping unparseable datagram [cause={cause}]."),
            },
            None => lock_sequencer(sequencer).note_failed(),
        }
    }

    // ===== teardown =====

    /// Pushes every worker toward exit. Run by the reader on its way out.
    fn shutdown_channels(&self) {
        let mut state = self.lock();
        if let Some(tx) = state.writer_tx.take() {
            let _ = tx.send(WriterCommand::Shutdown);
        }
        state.datagram_tx = None;
        if let Some(stop) = &state.datagram_stop {
            stop.store(true, Ordering::SeqCst);
        }
    }

    /// Closes the socket without tearing down state; idempotent.
    fn close_channel(&self) {
        let closer = self.lock().closer.clone();
        if let Some(closer) = closer {
            closer();
        }
    }

    /// Worker exit accounting; the last one out closes the channel and
    /// reports the close.
    fn worker_exited(&self) {
        {
            let mut state = self.lock();
            state.open_workers = state.open_workers.saturating_sub(1);
            if state.open_workers > 0 {
                return;
            }
            state.writer_tx = None;
            state.datagram_tx = None;
            state.datagram_stop = None;
            state.phase = Phase::Idle;
            state.last_write = 0;
            if let Some(closer) = state.closer.take() {
                closer();
            }
        }
        info!("Session channels closed.");
        self.host.connection_closed();
    }

    fn lock(&self) -> MutexGuard<'_, CommState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MessageSender for Communicator {
    fn send(&self, message: UpstreamMessage, transport: Transport) {
        let mut message = message;
        let state = self.lock();
        if !transport.is_reliable() {
            if let Some(tx) = &state.datagram_tx {
                match tx.send(message) {
                    Ok(()) => return,
                    // channel torn down between the check and the send;
                    // reclaim the message for the reliable path
                    Err(returned) => message = returned.0,
                }
            }
            // no datagram channel: the hint is corrected to reliable
            // rather than failing the send
            debug!("Datagram channel unavailable; delivering reliably.");
        }
        match &state.writer_tx {
            Some(tx) => {
                let _ = tx.send(WriterCommand::Deliver(message));
            }
            None => warn!("Dropping message sent while disconnected [message={message:?}]."),
        }
    }
}

fn read_message<R: Read>(
    frames: &mut FrameReader,
    source: &mut R,
) -> Result<DownstreamMessage, FrameError> {
    let frame = frames.read_frame(source)?;
    tether_shared::decode_downstream(&frame, millis_now())
}

fn unexpected_handshake_message(message: &DownstreamMessage) -> PortFailure {
    warn!("Unexpected handshake message [message={message:?}].");
    PortFailure::Terminal(LogonError::terminal(auth_codes::SERVER_ERROR))
}

fn is_timeout(cause: &io::Error) -> bool {
    matches!(
        cause.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn lock_sequencer(mutex: &Mutex<DatagramSequencer>) -> MutexGuard<'_, DatagramSequencer> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
