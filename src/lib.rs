//! WebSocket Event Relay Library
//!
//! Routes WebSocket connection events to per-path middleware chains and
//! shares publish/subscribe resources on a message broker between them.
//!
//! # Features
//! - Route table trie keyed by path segment and event name
//! - Middleware chains with single-shot continuation tokens
//! - Connection dispatcher over tokio-tungstenite
//! - Reference-counted broker producers and per-group consumers
//! - In-process broker adapter
//!
//! # Architecture
//! - `RouteTable` is built once at startup and frozen inside a `Dispatcher`
//! - Each connection runs on its own task; its events are dispatched in order
//! - `BrokerLedger` is the only shared mutable state, serialized by one lock
//! - Errors from a chain go to a single `ErrorSink`
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_relay::{relay, BrokerLedger, Dispatcher, MemoryBroker};
//!
//! #[tokio::main]
//! async fn main() {
//!     let ledger = Arc::new(BrokerLedger::new(Arc::new(MemoryBroker::new())));
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!
//!     Dispatcher::new(relay::routes(ledger, "rooms"))
//!         .serve(listener)
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod broker;
pub mod chain;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod memory;
pub mod message;
pub mod relay;
pub mod router;
pub mod server;
pub mod sink;
pub mod types;

// Re-export main types for convenience
pub use broker::{
    bus_handler, BrokerAdapter, BrokerAdmin, BrokerConsumer, BrokerProducer, BusEvent, BusHandler,
    BusRecord,
};
pub use chain::{handler, ChainOutcome, Handler, MiddlewareChain, Next, NextSignal};
pub use config::{RelayConfig, RetryPolicy};
pub use connection::Connection;
pub use error::{AppError, ErrorKind, SendError};
pub use handler::handle_connection;
pub use ledger::BrokerLedger;
pub use memory::MemoryBroker;
pub use message::{ErrorCode, Outbound, ServerMessage};
pub use router::RouteTable;
pub use server::Dispatcher;
pub use sink::{ErrorSink, ReplyErrorSink};
pub use types::{ConnectionId, Event};
