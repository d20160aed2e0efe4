//! # stomp-client
//!
//! A STOMP 1.0 pub/sub client transport and protocol engine: a blocking,
//! thread-based engine that owns a socket, a receiver thread, a reconnect
//! policy, and a listener registry, plus a stateless protocol encoder on
//! top of it.
//!
//! - [`frame`] — the wire format: [`frame::Frame`] serialize/parse.
//! - [`listener`] — [`listener::Listener`] callbacks and the
//!   [`listener::Publisher`] registry that fans frames out to them.
//! - [`socket`] — the [`socket::Socket`]/[`socket::Connector`] seam and
//!   their default TCP implementations.
//! - [`ids`] — the [`ids::IdSource`] seam for transaction/receipt ids.
//! - [`error`] — [`error::StompError`], the error type surfaced by the
//!   core.
//! - [`transport`] — [`transport::Transport`], the engine: connect,
//!   reconnect backoff, the receiver loop, and the framer.
//! - [`protocol`] — [`protocol::Protocol`], the STOMP 1.0 operation
//!   encoder (`CONNECT`, `SEND`, `SUBSCRIBE`, ...).
//!
//! ```no_run
//! use std::sync::Arc;
//! use stomp_client::listener::Listener;
//! use stomp_client::protocol::Protocol;
//! use stomp_client::transport::{HostAndPort, Transport};
//!
//! let transport = Transport::builder()
//!     .hosts_and_ports(vec![HostAndPort::new("localhost", 61613)])
//!     .build();
//! transport.start().unwrap();
//! let protocol = Protocol::new(transport.clone(), true);
//! protocol.connect(Some("guest"), Some("guest"), true, Default::default()).unwrap();
//! protocol.send("/queue/a", b"hello".to_vec(), None, Default::default()).unwrap();
//! transport.stop();
//! ```

pub mod error;
pub mod frame;
pub mod ids;
pub mod listener;
pub mod protocol;
pub mod socket;
pub mod transport;

pub use error::{StompError, StompResult};
pub use frame::Frame;
pub use ids::IdSource;
pub use listener::{Listener, Publisher};
pub use protocol::Protocol;
pub use socket::{Connector, Socket};
pub use transport::{HostAndPort, ReceiptPurpose, Transport, TransportBuilder};
