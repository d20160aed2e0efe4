//! # TRANSPORT
//!
//! Owns the socket, the read-side carryover buffer (the [Framer]), the
//! receiver thread, the reconnect policy, and the receipt table. Exposes
//! `start`/`stop`/`transmit`/`is_connected`/`has_connect_error`/
//! `set_listener`/`set_receipt`.
//!
//! Modeled as interface composition rather than base-class inheritance: a
//! [`Connector`]/[`Socket`] capability pair (the external collaborator)
//! plugged into this engine, which owns the framer, the receiver thread,
//! reconnect backoff, and listener fan-out.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, warn};

use crate::error::{StompError, StompResult};
use crate::frame::{
    Frame, Headers, CMD_CONNECTED, CMD_CONNECTING, CMD_DISCONNECT, CMD_DISCONNECTED, CMD_ERROR,
    CMD_MESSAGE, CMD_RECEIPT, CMD_RECEIVER_LOOP_COMPLETED, HEADER_RECEIPT, HEADER_RECEIPT_ID,
};
use crate::listener::{Listener, Publisher};
use crate::socket::{Connector, Socket, TcpConnector};

/// Upper bound on a single frame (before its terminating NUL). Frames
/// larger than this fail with [`StompError::FrameTooLarge`].
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// ## HOST AND PORT
///
/// One candidate endpoint. Multiple may be supplied to a [`Transport`];
/// every connect attempt tries each in declaration order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl Default for HostAndPort {
    fn default() -> Self {
        Self::new("localhost", 61613)
    }
}

/// What a pending receipt is for. The only purpose the core produces is
/// `Disconnect` — the RECEIPT that drives `disconnect_socket` — but this
/// is kept as a real enum rather than a string sentinel so additional
/// purposes are a non-breaking addition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiptPurpose {
    Disconnect,
}

/// How many connect attempts `attempt_connection` may make before giving
/// up. `Infinite` retries forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaxAttempts {
    Limited(u32),
    Infinite,
}

/// The reconnect tunables, plus an explicit, seeded RNG owned per
/// `Transport` instance (rather than a shared global generator) so tests
/// are reproducible.
pub struct ReconnectPolicy {
    pub initial_sleep: Duration,
    pub increase: f64,
    pub jitter: f64,
    pub max_sleep: Duration,
    pub max_attempts: MaxAttempts,
    rng: Mutex<StdRng>,
}

impl ReconnectPolicy {
    pub fn new(
        initial_sleep: Duration,
        increase: f64,
        jitter: f64,
        max_sleep: Duration,
        max_attempts: MaxAttempts,
    ) -> Self {
        let seed: u64 = rand::rng().random();
        Self {
            initial_sleep,
            increase,
            jitter,
            max_sleep,
            max_attempts,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Same tunables, but with the RNG seeded deterministically — used by
    /// tests that assert on exact sleep durations.
    pub fn seeded(
        initial_sleep: Duration,
        increase: f64,
        jitter: f64,
        max_sleep: Duration,
        max_attempts: MaxAttempts,
        seed: u64,
    ) -> Self {
        Self {
            initial_sleep,
            increase,
            jitter,
            max_sleep,
            max_attempts,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// `s_k = min(maxSleep, (initialSleep/(1+increase)) * (1+increase)^k * (1 + U*jitter))`.
    fn sleep_duration(&self, sleep_exp: u32) -> Duration {
        let unit = self.initial_sleep.as_secs_f64() / (1.0 + self.increase);
        let geometric = unit * (1.0 + self.increase).powi(sleep_exp as i32);
        let jittered = geometric * (1.0 + self.next_unit_random() * self.jitter);
        Duration::from_secs_f64(jittered.min(self.max_sleep.as_secs_f64()))
    }

    fn next_unit_random(&self) -> f64 {
        self.rng.lock().unwrap().random::<f64>()
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(100),
            0.5,
            0.1,
            Duration::from_secs(60),
            MaxAttempts::Limited(3),
        )
    }
}

/// The carryover buffer and stream-framing logic. Pure and
/// socket-agnostic: `feed` takes newly received bytes and returns any
/// complete frames, retaining a partial trailing frame as carryover.
pub struct Framer {
    buffer: Vec<u8>,
    max_size: usize,
}

impl Framer {
    pub fn new(max_size: usize) -> Self {
        Self { buffer: Vec::new(), max_size }
    }

    /// Current carryover length.
    pub fn buf_end(&self) -> usize {
        self.buffer.len()
    }

    /// Appends `incoming` to the carryover buffer and extracts every
    /// complete frame found. A NUL-terminated frame exceeding `max_size`,
    /// or a carryover that would exceed it with no NUL in sight, fails
    /// with [`StompError::FrameTooLarge`] — the two cases are kept as
    /// distinct branches rather than one fallthrough, so "buffer fully
    /// consumed" and "incomplete trailing frame" never get conflated.
    pub fn feed(&mut self, incoming: &[u8]) -> Result<Vec<Vec<u8>>, StompError> {
        self.buffer.extend_from_slice(incoming);
        let mut frames = Vec::new();
        let mut pos = 0usize;
        loop {
            if pos >= self.buffer.len() {
                // Case: the NUL we just consumed was the last byte in the
                // buffer — fully consumed, nothing to carry over.
                self.buffer.clear();
                break;
            }
            match self.buffer[pos..].iter().position(|&b| b == 0) {
                Some(null_rel) => {
                    let null_idx = pos + null_rel;
                    let frame_len = null_idx - pos;
                    if frame_len > self.max_size {
                        self.buffer.clear();
                        return Err(StompError::FrameTooLarge { size: frame_len, limit: self.max_size });
                    }
                    frames.push(self.buffer[pos..null_idx].to_vec());
                    pos = null_idx + 1;
                    while pos < self.buffer.len() && self.buffer[pos] == b'\n' {
                        pos += 1;
                    }
                }
                None => {
                    // Case: no NUL in sight — the remainder is an
                    // incomplete trailing frame, becomes the new carryover.
                    let partial_len = self.buffer.len() - pos;
                    if partial_len > self.max_size {
                        self.buffer.clear();
                        return Err(StompError::FrameTooLarge { size: partial_len, limit: self.max_size });
                    }
                    self.buffer.drain(0..pos);
                    return Ok(frames);
                }
            }
        }
        Ok(frames)
    }
}

struct TransportState {
    running: bool,
    connected: bool,
    connection_error: bool,
    current_host_and_port: Option<HostAndPort>,
    disconnect_receipt_id: Option<String>,
    notified_on_disconnect: bool,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            running: false,
            connected: false,
            connection_error: false,
            current_host_and_port: None,
            disconnect_receipt_id: None,
            notified_on_disconnect: false,
        }
    }
}

/// Configuration accepted by [`TransportBuilder`].
pub struct TransportConfig {
    pub hosts_and_ports: Vec<HostAndPort>,
    pub auto_decode: bool,
    pub encoding: String,
    pub reconnect: ReconnectPolicy,
    pub max_frame_size: usize,
    pub connector: Arc<dyn Connector>,
    /// Overrides the function used to sleep between reconnect attempts.
    /// `None` uses `std::thread::sleep`; tests substitute a no-op that
    /// records durations instead, so backoff tests don't actually block.
    pub sleep_fn: Option<Arc<dyn Fn(Duration) + Send + Sync>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hosts_and_ports: vec![HostAndPort::default()],
            auto_decode: true,
            encoding: "utf8".to_string(),
            reconnect: ReconnectPolicy::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connector: Arc::new(TcpConnector::default()),
            sleep_fn: None,
        }
    }
}

/// Fluent builder for [`Transport`].
#[derive(Default)]
pub struct TransportBuilder {
    config: TransportConfig,
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hosts_and_ports(mut self, hosts_and_ports: Vec<HostAndPort>) -> Self {
        self.config.hosts_and_ports = hosts_and_ports;
        self
    }

    pub fn auto_decode(mut self, auto_decode: bool) -> Self {
        self.config.auto_decode = auto_decode;
        self
    }

    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.config.encoding = encoding.into();
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.config.max_frame_size = max_frame_size;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.config.connector = connector;
        self
    }

    pub fn sleep_fn(mut self, sleep_fn: Arc<dyn Fn(Duration) + Send + Sync>) -> Self {
        self.config.sleep_fn = Some(sleep_fn);
        self
    }

    pub fn build(self) -> Arc<Transport> {
        Transport::from_config(self.config)
    }
}

/// The transport engine. Always held behind an `Arc` so the receiver
/// thread can share ownership with the caller.
pub struct Transport {
    registry: Publisher,
    socket: Mutex<Option<Box<dyn Socket>>>,
    connector: Arc<dyn Connector>,
    state: RwLock<TransportState>,
    hosts_and_ports: Vec<HostAndPort>,
    reconnect: ReconnectPolicy,
    receipts: Mutex<HashMap<String, ReceiptPurpose>>,
    connect_waiters: Mutex<Vec<oneshot::Sender<bool>>>,
    framer: Mutex<Framer>,
    receiver_handle: Mutex<Option<JoinHandle<()>>>,
    sleep: Arc<dyn Fn(Duration) + Send + Sync>,
    auto_decode: bool,
    encoding: String,
}

fn default_sleep_fn() -> Arc<dyn Fn(Duration) + Send + Sync> {
    Arc::new(thread::sleep)
}

impl Transport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    pub(crate) fn from_config(config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Publisher::new(),
            socket: Mutex::new(None),
            connector: config.connector,
            state: RwLock::new(TransportState::default()),
            hosts_and_ports: config.hosts_and_ports,
            reconnect: config.reconnect,
            receipts: Mutex::new(HashMap::new()),
            connect_waiters: Mutex::new(Vec::new()),
            framer: Mutex::new(Framer::new(config.max_frame_size)),
            receiver_handle: Mutex::new(None),
            sleep: config.sleep_fn.unwrap_or_else(default_sleep_fn),
            auto_decode: config.auto_decode,
            encoding: config.encoding,
        })
    }

    // -- Listener registry -------------------------------------------------

    pub fn set_listener(&self, name: impl Into<String>, listener: Arc<dyn Listener>) {
        self.registry.set_listener(name, listener);
    }

    pub fn remove_listener(&self, name: &str) {
        self.registry.remove_listener(name);
    }

    pub fn get_listener(&self, name: &str) -> Option<Arc<dyn Listener>> {
        self.registry.get_listener(name)
    }

    // -- Queries -------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        let state = self.state.read().unwrap();
        self.socket.lock().unwrap().is_some() && state.connected
    }

    pub fn has_connect_error(&self) -> bool {
        self.state.read().unwrap().connection_error
    }

    pub fn set_receipt(&self, receipt_id: impl Into<String>, purpose: Option<ReceiptPurpose>) {
        let receipt_id = receipt_id.into();
        let mut receipts = self.receipts.lock().unwrap();
        match purpose {
            Some(purpose) => {
                receipts.insert(receipt_id, purpose);
            }
            None => {
                receipts.remove(&receipt_id);
            }
        }
    }

    /// Blocks the caller until the connect condition is signaled by a
    /// `CONNECTED` event or by a connect error, or until `timeout` elapses.
    /// `timeout == Duration::ZERO` waits indefinitely. Never raises; on
    /// expiry it simply returns.
    pub fn wait_for_connection(&self, timeout: Duration) {
        if self.is_connected() || self.has_connect_error() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.connect_waiters.lock().unwrap().push(tx);
        if timeout.is_zero() {
            let _ = rx.recv();
        } else {
            let _ = rx.recv_timeout(timeout);
        }
    }

    fn wake_connect_waiters(&self, outcome: bool) {
        let waiters: Vec<_> = std::mem::take(&mut *self.connect_waiters.lock().unwrap());
        for waiter in waiters {
            let _ = waiter.send(outcome);
        }
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Moves the transport to running: attempts the initial connection,
    /// then spawns the receiver thread. Must be called before any
    /// listener will observe frames.
    pub fn start(self: &Arc<Self>) -> StompResult<()> {
        self.state.write().unwrap().running = true;
        self.registry.dispatch(&Frame::pseudo(CMD_CONNECTING), None);
        self.attempt_connection()?;

        let this = self.clone();
        let handle = thread::spawn(move || this.receiver_loop());
        *self.receiver_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Moves the transport to stopped: clears `running` and joins the
    /// receiver thread. Idempotent; safe to call after a failed `start`.
    pub fn stop(self: &Arc<Self>) {
        self.state.write().unwrap().running = false;
        if let Some(mut socket) = self.socket.lock().unwrap().take() {
            socket.close();
        }
        if let Some(handle) = self.receiver_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    // -- Reconnect state machine ----------------------------------------------

    pub fn attempt_connection(self: &Arc<Self>) -> StompResult<()> {
        self.state.write().unwrap().connection_error = false;
        let mut sleep_exp: u32 = 1;
        let mut connect_count: u32 = 0;

        loop {
            if !self.state.read().unwrap().running {
                break;
            }
            if self.socket.lock().unwrap().is_some() {
                break;
            }
            if let MaxAttempts::Limited(max) = self.reconnect.max_attempts {
                if connect_count >= max {
                    break;
                }
            }

            let mut connected_host = None;
            for host_and_port in &self.hosts_and_ports {
                debug!(host = %host_and_port.host, port = host_and_port.port, "attempting connection");
                match self.connector.connect(&host_and_port.host, host_and_port.port) {
                    Ok(socket) => {
                        *self.socket.lock().unwrap() = Some(socket);
                        connected_host = Some(host_and_port.clone());
                        break;
                    }
                    Err(error) => {
                        warn!(host = %host_and_port.host, port = host_and_port.port, %error, "connect attempt failed");
                        connect_count += 1;
                    }
                }
            }

            if let Some(host_and_port) = connected_host {
                self.state.write().unwrap().current_host_and_port = Some(host_and_port);
                break;
            }

            if let MaxAttempts::Limited(max) = self.reconnect.max_attempts {
                if connect_count >= max {
                    break;
                }
            }

            let sleep_duration = self.reconnect.sleep_duration(sleep_exp);
            debug!(?sleep_duration, sleep_exp, "backing off before next connect attempt");
            (self.sleep)(sleep_duration);
            if sleep_duration < self.reconnect.max_sleep {
                sleep_exp += 1;
            }
        }

        if self.socket.lock().unwrap().is_none() {
            self.state.write().unwrap().connection_error = true;
            self.wake_connect_waiters(false);
            return Err(StompError::ConnectFailed);
        }
        Ok(())
    }

    // -- Transmit ----------------------------------------------------------

    /// Serializes `frame`, fires `on_send` on every listener, and writes
    /// it (plus the terminating NUL) to the socket. If the frame is a
    /// `DISCONNECT` carrying a `receipt` header, its receipt id is
    /// recorded so the matching `RECEIPT` drives `disconnect_socket`.
    pub fn transmit(&self, frame: &Frame) -> StompResult<()> {
        self.registry.dispatch_send(frame);
        if frame.command == CMD_DISCONNECT {
            if let Some(receipt_id) = frame.header(HEADER_RECEIPT) {
                self.state.write().unwrap().disconnect_receipt_id = Some(receipt_id.to_string());
            }
        }
        let mut bytes = frame.serialize();
        bytes.push(0);
        let mut guard = self.socket.lock().unwrap();
        match guard.as_mut() {
            Some(socket) => socket.send(&bytes).map_err(StompError::from),
            None => Err(StompError::NotConnected),
        }
    }

    // -- Receiver loop -------------------------------------------------------

    fn receiver_loop(self: Arc<Self>) {
        let mut recv_buf = [0u8; 4096];
        while self.state.read().unwrap().running {
            let frames = match self.read(&mut recv_buf) {
                Ok(frames) => frames,
                Err(error) => {
                    self.report_socket_failure(&error);
                    break;
                }
            };
            for content in frames {
                match Frame::parse(&content) {
                    Ok(frame) => self.process_frame(frame),
                    Err(error) => {
                        warn!(%error, "malformed frame, resynchronizing at next NUL");
                        self.notify(&Frame::new(
                            CMD_ERROR,
                            {
                                let mut headers = Headers::new();
                                headers.insert("message".into(), error.to_string());
                                headers
                            },
                            Vec::new(),
                        ));
                    }
                }
            }
        }
        self.notify(&Frame::pseudo(CMD_RECEIVER_LOOP_COMPLETED));
        if !self.state.read().unwrap().notified_on_disconnect {
            self.notify(&Frame::pseudo(CMD_DISCONNECTED));
        }
    }

    fn report_socket_failure(&self, error: &io::Error) {
        error!(%error, "socket failure, ending receiver loop");
        let mut headers = Headers::new();
        headers.insert("message".into(), error.to_string());
        self.notify(&Frame::new(CMD_ERROR, headers, Vec::new()));
        self.disconnect_socket();
    }

    /// Blocks (briefly) in the socket's `recv`, feeding whatever arrives
    /// into the [Framer] and returning any complete frames.
    fn read(&self, buf: &mut [u8]) -> io::Result<Vec<Vec<u8>>> {
        let bytes_read = {
            let mut guard = self.socket.lock().unwrap();
            match guard.as_mut() {
                Some(socket) => match socket.recv(buf) {
                    Ok(n) => n,
                    Err(error)
                        if error.kind() == io::ErrorKind::WouldBlock
                            || error.kind() == io::ErrorKind::TimedOut =>
                    {
                        return Ok(Vec::new());
                    }
                    Err(error) => return Err(error),
                },
                None => return Ok(Vec::new()),
            }
        };
        if bytes_read == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection"));
        }
        self.framer
            .lock()
            .unwrap()
            .feed(&buf[..bytes_read])
            .map_err(|stomp_error| io::Error::new(io::ErrorKind::InvalidData, stomp_error.to_string()))
    }

    /// For a `MESSAGE` frame, synthesizes a `BEFORE_MESSAGE` event first,
    /// re-reads its (possibly listener-mutated) headers/body back into the
    /// frame, then dispatches `MESSAGE`. Other recognized commands
    /// dispatch directly.
    ///
    /// When `auto_decode` is on and `encoding` is `"utf8"`, a `MESSAGE`
    /// body that isn't valid UTF-8 is treated like any other malformed
    /// input: reported as a synthetic `ERROR` dispatch instead of
    /// `MESSAGE`, and the receiver keeps running. Any other `encoding`
    /// name is accepted but not independently validated — only UTF-8 has
    /// a decode check here.
    pub fn process_frame(&self, mut frame: Frame) {
        if frame.command == CMD_MESSAGE && self.auto_decode && self.encoding.eq_ignore_ascii_case("utf8") {
            if let Err(error) = std::str::from_utf8(&frame.body) {
                warn!(%error, "message body failed utf-8 decode, reporting as malformed");
                let mut headers = Headers::new();
                headers.insert("message".into(), format!("body is not valid utf8: {error}"));
                self.notify(&Frame::new(CMD_ERROR, headers, Vec::new()));
                return;
            }
        }
        let excluded = if frame.command == CMD_MESSAGE {
            self.registry.dispatch_before_message(&mut frame)
        } else {
            Vec::new()
        };
        self.notify_excluding(&frame, &excluded);
    }

    // -- notify policy --------------------------------------------------------

    pub fn notify(&self, frame: &Frame) {
        self.notify_excluding(frame, &[]);
    }

    /// Like [`notify`], but skips `excluded` listeners for the dispatch
    /// fan-out — used for a `MESSAGE` whose `on_before_message` just
    /// panicked on one listener, per the design note excluding that
    /// listener from the following `MESSAGE` event.
    ///
    /// [`notify`]: Transport::notify
    fn notify_excluding(&self, frame: &Frame, excluded: &[String]) {
        match frame.command.as_str() {
            CMD_RECEIPT => self.handle_receipt(frame),
            CMD_CONNECTED => {
                self.state.write().unwrap().connected = true;
                self.wake_connect_waiters(true);
            }
            CMD_DISCONNECTED => {
                let mut state = self.state.write().unwrap();
                state.connected = false;
                state.notified_on_disconnect = true;
            }
            _ => {}
        }

        let host_and_port = self.state.read().unwrap().current_host_and_port.clone();
        self.registry.dispatch_excluding(frame, host_and_port.as_ref(), excluded);

        if frame.command == CMD_ERROR && !self.is_connected() {
            self.state.write().unwrap().connection_error = true;
            self.wake_connect_waiters(false);
        }
    }

    fn handle_receipt(&self, frame: &Frame) {
        let Some(receipt_id) = frame.header(HEADER_RECEIPT_ID) else {
            return;
        };
        let purpose = self.receipts.lock().unwrap().remove(receipt_id);
        if purpose == Some(ReceiptPurpose::Disconnect) {
            self.state.write().unwrap().connected = false;
            let matches_disconnect = self.state.read().unwrap().disconnect_receipt_id.as_deref()
                == Some(receipt_id);
            if matches_disconnect {
                self.disconnect_socket();
                self.state.write().unwrap().disconnect_receipt_id = None;
            }
        }
    }

    // -- Disconnect ------------------------------------------------------------

    /// Tears down the socket: clears `running` and `current_host_and_port`,
    /// closes and drops the socket, and emits a synthetic `DISCONNECTED`
    /// frame (which cascades through `notify`).
    pub fn disconnect_socket(&self) {
        {
            let mut state = self.state.write().unwrap();
            state.running = false;
            state.current_host_and_port = None;
        }
        if let Some(mut socket) = self.socket.lock().unwrap().take() {
            socket.close();
        }
        self.notify(&Frame::pseudo(CMD_DISCONNECTED));
    }
}
