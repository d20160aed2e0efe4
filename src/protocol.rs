//! # PROTOCOL
//!
//! A thin STOMP 1.0 encoder sitting in front of a [`Transport`]: each
//! public method builds a [`Frame`] with the headers the wire format
//! requires and hands it to `transport.transmit`. Caller-supplied extra
//! headers are merged in first and only overridden for the keys the
//! protocol itself must control.
//!
//! The protocol registers itself as a listener on its transport via a
//! non-owning entry rather than a self-referential cycle, so the
//! transport holds no strong reference back to the protocol.

use std::sync::Arc;

use crate::error::StompResult;
use crate::frame::{
    Frame, Headers, CMD_ABORT, CMD_ACK, CMD_BEGIN, CMD_COMMIT, CMD_CONNECT, CMD_DISCONNECT,
    CMD_SEND, CMD_SUBSCRIBE, CMD_UNSUBSCRIBE, HEADER_ACCEPT_VERSION, HEADER_ACK,
    HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE, HEADER_DESTINATION, HEADER_ID, HEADER_LOGIN,
    HEADER_MESSAGE_ID, HEADER_PASSCODE, HEADER_RECEIPT, HEADER_TRANSACTION,
};
use crate::ids::{default_id_source, IdSource};
use crate::listener::Listener;
use crate::transport::{ReceiptPurpose, Transport};

const STOMP_VERSION: &str = "1.0";

/// Listener entry the [`Protocol`] registers itself under, so a connection
/// listener override installed by subclassing user code can see the same
/// lifecycle events without the protocol re-registering.
pub const PROTOCOL_LISTENER_NAME: &str = "protocol-listener";

/// No-op placeholder listener used for the protocol's registry entry.
/// `Protocol` itself is not a `Listener` (it holds an `Arc<Transport>`, not
/// the reverse), so the registered listener is this empty forwarder; the
/// entry exists so the reserved name `"protocol-listener"` is occupied,
/// leaving room for subclassing user code to override it.
struct ProtocolListener;
impl Listener for ProtocolListener {}

/// STOMP 1.0 encoder over a [`Transport`]. Stateless apart from
/// `auto_content_length` and the [`IdSource`] used to mint transaction and
/// receipt ids when the caller doesn't supply one.
pub struct Protocol {
    transport: Arc<Transport>,
    auto_content_length: bool,
    ids: Arc<dyn IdSource>,
}

impl Protocol {
    /// Builds a protocol over `transport` and registers its placeholder
    /// listener under [`PROTOCOL_LISTENER_NAME`].
    pub fn new(transport: Arc<Transport>, auto_content_length: bool) -> Self {
        transport.set_listener(PROTOCOL_LISTENER_NAME, Arc::new(ProtocolListener));
        Self { transport, auto_content_length, ids: default_id_source() }
    }

    /// As [`new`], but with an explicit [`IdSource`] instead of the
    /// default UUID generator.
    ///
    /// [`new`]: Protocol::new
    pub fn with_id_source(
        transport: Arc<Transport>,
        auto_content_length: bool,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        transport.set_listener(PROTOCOL_LISTENER_NAME, Arc::new(ProtocolListener));
        Self { transport, auto_content_length, ids }
    }

    fn send_frame(&self, command: &str, headers: Headers, body: Vec<u8>) -> StompResult<()> {
        self.transport.transmit(&Frame::new(command, headers, body))
    }

    /// `CONNECT`. If `wait`, blocks on the transport's connect condition
    /// (indefinitely) and raises [`StompError::ConnectFailed`] if the
    /// transport reports a connect error.
    ///
    /// [`StompError::ConnectFailed`]: crate::error::StompError::ConnectFailed
    pub fn connect(
        &self,
        username: Option<&str>,
        passcode: Option<&str>,
        wait: bool,
        extra_headers: Headers,
    ) -> StompResult<()> {
        let mut headers = extra_headers;
        headers.insert(HEADER_ACCEPT_VERSION.to_string(), STOMP_VERSION.to_string());
        if let Some(username) = username {
            headers.insert(HEADER_LOGIN.to_string(), username.to_string());
        }
        if let Some(passcode) = passcode {
            headers.insert(HEADER_PASSCODE.to_string(), passcode.to_string());
        }
        self.send_frame(CMD_CONNECT, headers, Vec::new())?;
        if wait {
            self.transport.wait_for_connection(std::time::Duration::ZERO);
            if self.transport.has_connect_error() {
                return Err(crate::error::StompError::ConnectFailed);
            }
        }
        Ok(())
    }

    /// `SEND`. When `auto_content_length` is on and the caller did not
    /// already set `content-length`, it is computed from `body.len()` and
    /// written as decimal ASCII.
    pub fn send(
        &self,
        destination: &str,
        body: impl Into<Vec<u8>>,
        content_type: Option<&str>,
        extra_headers: Headers,
    ) -> StompResult<()> {
        let body = body.into();
        let mut headers = extra_headers;
        headers.insert(HEADER_DESTINATION.to_string(), destination.to_string());
        if let Some(content_type) = content_type {
            headers.insert(HEADER_CONTENT_TYPE.to_string(), content_type.to_string());
        }
        if self.auto_content_length && !headers.contains_key(HEADER_CONTENT_LENGTH) {
            headers.insert(HEADER_CONTENT_LENGTH.to_string(), body.len().to_string());
        }
        self.send_frame(CMD_SEND, headers, body)
    }

    /// `SUBSCRIBE`.
    pub fn subscribe(
        &self,
        destination: &str,
        id: Option<&str>,
        ack: &str,
        extra_headers: Headers,
    ) -> StompResult<()> {
        let mut headers = extra_headers;
        headers.insert(HEADER_DESTINATION.to_string(), destination.to_string());
        if let Some(id) = id {
            headers.insert(HEADER_ID.to_string(), id.to_string());
        }
        headers.insert(HEADER_ACK.to_string(), ack.to_string());
        self.send_frame(CMD_SUBSCRIBE, headers, Vec::new())
    }

    /// `UNSUBSCRIBE` by destination.
    pub fn unsubscribe_destination(&self, destination: &str, extra_headers: Headers) -> StompResult<()> {
        let mut headers = extra_headers;
        headers.insert(HEADER_DESTINATION.to_string(), destination.to_string());
        self.send_frame(CMD_UNSUBSCRIBE, headers, Vec::new())
    }

    /// `UNSUBSCRIBE` by subscription id.
    pub fn unsubscribe_id(&self, id: &str, extra_headers: Headers) -> StompResult<()> {
        let mut headers = extra_headers;
        headers.insert(HEADER_ID.to_string(), id.to_string());
        self.send_frame(CMD_UNSUBSCRIBE, headers, Vec::new())
    }

    /// `ACK`.
    pub fn ack(
        &self,
        message_id: &str,
        transaction: Option<&str>,
        receipt: Option<&str>,
        extra_headers: Headers,
    ) -> StompResult<()> {
        let mut headers = extra_headers;
        headers.insert(HEADER_MESSAGE_ID.to_string(), message_id.to_string());
        if let Some(transaction) = transaction {
            headers.insert(HEADER_TRANSACTION.to_string(), transaction.to_string());
        }
        if let Some(receipt) = receipt {
            headers.insert(HEADER_RECEIPT.to_string(), receipt.to_string());
        }
        self.send_frame(CMD_ACK, headers, Vec::new())
    }

    /// `BEGIN`. Returns the transaction id, generated if not supplied.
    pub fn begin(&self, transaction: Option<&str>, extra_headers: Headers) -> StompResult<String> {
        let transaction_id = transaction.map(str::to_string).unwrap_or_else(|| self.ids.next_id());
        let mut headers = extra_headers;
        headers.insert(HEADER_TRANSACTION.to_string(), transaction_id.clone());
        self.send_frame(CMD_BEGIN, headers, Vec::new())?;
        Ok(transaction_id)
    }

    /// `COMMIT`.
    pub fn commit(&self, transaction: &str, extra_headers: Headers) -> StompResult<()> {
        let mut headers = extra_headers;
        headers.insert(HEADER_TRANSACTION.to_string(), transaction.to_string());
        self.send_frame(CMD_COMMIT, headers, Vec::new())
    }

    /// `ABORT`.
    pub fn abort(&self, transaction: &str, extra_headers: Headers) -> StompResult<()> {
        let mut headers = extra_headers;
        headers.insert(HEADER_TRANSACTION.to_string(), transaction.to_string());
        self.send_frame(CMD_ABORT, headers, Vec::new())
    }

    /// `DISCONNECT`. Registers the (generated, if not supplied) receipt id
    /// against [`ReceiptPurpose::Disconnect`] before transmitting, so the
    /// matching `RECEIPT` drives `disconnect_socket`.
    pub fn disconnect(&self, receipt: Option<&str>, extra_headers: Headers) -> StompResult<()> {
        let receipt_id = receipt.map(str::to_string).unwrap_or_else(|| self.ids.next_id());
        self.transport.set_receipt(receipt_id.clone(), Some(ReceiptPurpose::Disconnect));
        let mut headers = extra_headers;
        headers.insert(HEADER_RECEIPT.to_string(), receipt_id);
        self.send_frame(CMD_DISCONNECT, headers, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StompError;
    use crate::socket::{Connector, Socket};
    use crate::transport::{HostAndPort, TransportConfig};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingSocket {
        outbound: Arc<Mutex<Vec<u8>>>,
        inbound: Arc<Mutex<VecDeque<u8>>>,
    }

    impl Socket for RecordingSocket {
        fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.outbound.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inbound = self.inbound.lock().unwrap();
            if inbound.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let mut n = 0;
            while n < buf.len() {
                match inbound.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn close(&mut self) {}
    }

    struct RecordingConnector {
        outbound: Arc<Mutex<Vec<u8>>>,
        inbound: Arc<Mutex<VecDeque<u8>>>,
    }

    impl Connector for RecordingConnector {
        fn connect(&self, _host: &str, _port: u16) -> io::Result<Box<dyn Socket>> {
            Ok(Box::new(RecordingSocket {
                outbound: self.outbound.clone(),
                inbound: self.inbound.clone(),
            }))
        }
    }

    fn test_transport(auto_content_length: bool) -> (Arc<Transport>, Protocol, Arc<Mutex<Vec<u8>>>, Arc<Mutex<VecDeque<u8>>>) {
        let outbound = Arc::new(Mutex::new(Vec::new()));
        let inbound = Arc::new(Mutex::new(VecDeque::new()));
        let mut config = TransportConfig::default();
        config.hosts_and_ports = vec![HostAndPort::new("x", 1)];
        config.connector = Arc::new(RecordingConnector { outbound: outbound.clone(), inbound: inbound.clone() });
        let transport = Transport::from_config(config);
        transport.start().unwrap();
        let protocol = Protocol::new(transport.clone(), auto_content_length);
        (transport, protocol, outbound, inbound)
    }

    // -- Scenario 4: SEND auto-content-length ---------------------------------

    #[test]
    fn send_includes_content_length_when_auto_content_length_is_on() {
        let (transport, protocol, outbound, _inbound) = test_transport(true);
        protocol.send("/q", b"hello".to_vec(), None, Headers::new()).unwrap();
        let sent = outbound.lock().unwrap().clone();
        let frame_bytes = &sent[..sent.len() - 1];
        let frame = Frame::parse(frame_bytes).unwrap();
        assert_eq!(frame.header(HEADER_CONTENT_LENGTH), Some("5"));
        transport.stop();
    }

    #[test]
    fn send_omits_content_length_when_auto_content_length_is_off_and_uncontrolled() {
        let (transport, protocol, outbound, _inbound) = test_transport(false);
        protocol.send("/q", b"hello".to_vec(), None, Headers::new()).unwrap();
        let sent = outbound.lock().unwrap().clone();
        let frame_bytes = &sent[..sent.len() - 1];
        let frame = Frame::parse(frame_bytes).unwrap();
        assert_eq!(frame.header(HEADER_CONTENT_LENGTH), None);
        transport.stop();
    }

    // -- Scenario 5: BEFORE_MESSAGE mutation ----------------------------------

    struct MutatingListener {
        observed_body: Mutex<Option<Vec<u8>>>,
    }

    impl Listener for MutatingListener {
        fn on_before_message(&self, frame: &mut Frame) {
            frame.body = b"mutated".to_vec();
        }

        fn on_message(&self, frame: &Frame) {
            *self.observed_body.lock().unwrap() = Some(frame.body.clone());
        }
    }

    #[test]
    fn before_message_mutation_is_observed_by_on_message() {
        let (transport, _protocol, _outbound, inbound) = test_transport(true);
        let listener = Arc::new(MutatingListener { observed_body: Mutex::new(None) });
        transport.set_listener("x", listener.clone());

        inbound.lock().unwrap().extend(b"MESSAGE\ndestination:/q\n\noriginal\0".iter().copied());
        std::thread::sleep(std::time::Duration::from_millis(300));

        assert_eq!(listener.observed_body.lock().unwrap().as_deref(), Some(b"mutated".as_slice()));
        transport.stop();
    }

    // -- Scenario 6: ERROR during connect -------------------------------------

    struct ErrorCountingListener {
        errors: AtomicUsize,
    }

    impl Listener for ErrorCountingListener {
        fn on_error(&self, _frame: &Frame) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn error_during_connect_fails_wait_and_notifies_listeners() {
        let outbound = Arc::new(Mutex::new(Vec::new()));
        let inbound = Arc::new(Mutex::new(VecDeque::new()));
        let mut config = TransportConfig::default();
        config.hosts_and_ports = vec![HostAndPort::new("x", 1)];
        config.connector = Arc::new(RecordingConnector { outbound: outbound.clone(), inbound: inbound.clone() });
        let transport = Transport::from_config(config);

        let listener = Arc::new(ErrorCountingListener { errors: AtomicUsize::new(0) });
        transport.set_listener("errors", listener.clone());
        transport.start().unwrap();
        let protocol = Protocol::new(transport.clone(), true);

        inbound.lock().unwrap().extend(b"ERROR\nmessage:bad login\n\n\0".iter().copied());
        // give the receiver a moment to dispatch ERROR before connect(wait) checks
        std::thread::sleep(std::time::Duration::from_millis(300));

        let result = protocol.connect(None, None, true, Headers::new());
        assert!(matches!(result, Err(StompError::ConnectFailed)));
        assert!(listener.errors.load(Ordering::SeqCst) >= 1);
        transport.stop();
    }

    // -- Invariant 5: connected iff last event CONNECTED with no following
    //    DISCONNECTED/disconnect-receipt ------------------------------------

    #[test]
    fn connected_is_true_only_between_connected_and_disconnected_events() {
        let (transport, _protocol, _outbound, inbound) = test_transport(true);
        assert!(!transport.is_connected());

        inbound.lock().unwrap().extend(b"CONNECTED\n\n\0".iter().copied());
        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(transport.is_connected());

        transport.disconnect_socket();
        assert!(!transport.is_connected());
    }

    // -- "Transmit ordering" law ------------------------------------------------

    #[test]
    fn successive_transmits_preserve_call_order_in_the_write_stream() {
        let (transport, protocol, outbound, _inbound) = test_transport(true);
        protocol.send("/a", b"1".to_vec(), None, Headers::new()).unwrap();
        protocol.send("/b", b"2".to_vec(), None, Headers::new()).unwrap();
        let sent = outbound.lock().unwrap().clone();
        let first_destination = sent.windows(2).position(|w| w == b"/a").unwrap();
        let second_destination = sent.windows(2).position(|w| w == b"/b").unwrap();
        assert!(first_destination < second_destination);
        transport.stop();
    }

    #[test]
    fn disconnect_registers_receipt_before_transmitting() {
        let (transport, protocol, outbound, _inbound) = test_transport(true);
        protocol.disconnect(Some("r1"), Headers::new()).unwrap();
        let sent = outbound.lock().unwrap().clone();
        let frame_bytes = &sent[..sent.len() - 1];
        let frame = Frame::parse(frame_bytes).unwrap();
        assert_eq!(frame.header(HEADER_RECEIPT), Some("r1"));
        transport.stop();
    }
}
