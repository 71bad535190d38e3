//! scadalink - asynchronous connection/messaging runtime for SCADA middleware
//!
//! Every scadalink protocol client (data access, historical data,
//! alarms/events, proxying) sits on top of the same substrate: one logical
//! connection with a supervised lifecycle, a versioned session handshake,
//! and request/reply correlation with timeout supervision over a long-lived
//! socket.
//!
//! # Architecture
//!
//! This library is organized as a workspace with multiple crates:
//!
//! - `scadalink-core`: message type, command codes, errors, configuration
//! - `scadalink-transport`: transport adapter traits, frame codec, TCP
//! - `scadalink-runtime`: connection state machine, session negotiation,
//!   message correlation, keepalive
//!
//! # Usage
//!
//! ```no_run
//! use scadalink::runtime::ClientConnection;
//! use scadalink::transport::{TcpConnector, TcpConnectorSettings};
//! use scadalink::{ConnectionOptions, ConnectionState};
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let options = ConnectionOptions::default();
//! let connector = Arc::new(TcpConnector::new(TcpConnectorSettings::new(
//!     options.connect_timeout(),
//!     options.ping_period(),
//! )));
//! let client = ClientConnection::new("10.0.0.7:1202", options, connector, "1.1");
//!
//! let mut state = client.subscribe_state();
//! client.connect();
//! state.wait_for(|s| *s == ConnectionState::Bound).await.unwrap();
//! # }
//! ```

// Re-export core types
pub use scadalink_core::{codes, fields, ConnectionOptions, LinkError, LinkResult, Message, Value};

// Re-export the runtime API
pub use scadalink_runtime::{ClientConnection, Connection, ConnectionState};

pub mod transport {
    pub use scadalink_transport::*;
}

pub mod runtime {
    pub use scadalink_runtime::*;
}
