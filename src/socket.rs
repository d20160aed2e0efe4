//! # SOCKET
//!
//! The raw TCP byte-stream primitive is modeled as an external
//! collaborator: blocking `connect`/`send`/`recv`/`close`, surfacing a
//! distinguished "socket failure" error. [`Socket`] and [`Connector`] are
//! that seam; [`TcpSocket`]/[`TcpConnector`] are the default, real
//! implementation over `std::net::TcpStream`: a blocking connect with a
//! timeout, then a short read timeout so the receiver thread can notice a
//! shutdown request between reads.

use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Connect timeout used when dialing a single host/port pair.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read timeout applied to the socket so `recv` returns (with a timeout
/// error, which the receiver treats as "nothing arrived yet") periodically
/// even when the peer is silent, letting the receiver thread observe a
/// `running == false` shutdown request promptly instead of blocking
/// forever in a single `read`.
pub const DEFAULT_RECV_POLL: Duration = Duration::from_millis(250);

/// A bound duplex byte-stream connection.
pub trait Socket: Send {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read whatever is available into `buf`, returning the number of
    /// bytes read (0 on EOF). A timeout while polling for data is *not*
    /// an error from the caller's point of view; implementations should
    /// surface it as `Ok(0)`... except a plain `recv` cannot distinguish
    /// "peer closed" from "nothing arrived yet" that way, so instead
    /// timeouts are reported via `io::ErrorKind::WouldBlock` /
    /// `TimedOut`, which [`Transport`] treats specially.
    ///
    /// [`Transport`]: crate::transport::Transport
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&mut self);
}

/// Dials a `(host, port)` pair and returns a bound [`Socket`].
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Socket>>;
}

/// Blocking TCP implementation of [`Socket`].
pub struct TcpSocket {
    stream: TcpStream,
}

impl Socket for TcpSocket {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.stream.write_all(bytes)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        self.stream.read(buf)
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Blocking TCP implementation of [`Connector`].
pub struct TcpConnector {
    connect_timeout: Duration,
    recv_poll: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { connect_timeout: DEFAULT_CONNECT_TIMEOUT, recv_poll: DEFAULT_RECV_POLL }
    }
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, recv_poll: Duration) -> Self {
        Self { connect_timeout, recv_poll }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn Socket>> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"))?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_read_timeout(Some(self.recv_poll))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpSocket { stream }))
    }
}
