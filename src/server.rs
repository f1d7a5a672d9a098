//! Connection dispatcher
//!
//! Binds a route table to live connections. The route table is frozen once
//! the dispatcher is built and shared read-only by every connection task.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::chain::ChainOutcome;
use crate::config::DEFAULT_OUTBOUND_BUFFER;
use crate::connection::Connection;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::router::RouteTable;
use crate::sink::{ErrorSink, ReplyErrorSink};
use crate::types::Event;

/// Routes connection events to middleware chains
#[derive(Clone)]
pub struct Dispatcher {
    routes: Arc<RouteTable>,
    sink: Arc<dyn ErrorSink>,
    outbound_buffer: usize,
}

impl Dispatcher {
    /// Create a dispatcher with the default error sink
    pub fn new(routes: RouteTable) -> Self {
        Self {
            routes: Arc::new(routes),
            sink: Arc::new(ReplyErrorSink::default()),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }

    /// Replace the error sink
    pub fn with_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Set the per-connection outbound queue size
    pub fn with_outbound_buffer(mut self, size: usize) -> Self {
        self.outbound_buffer = size.max(1);
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn outbound_buffer(&self) -> usize {
        self.outbound_buffer
    }

    /// Resolve and run the chain for `event` on `conn`
    pub async fn dispatch(
        &self,
        conn: &Connection,
        event: Event,
        context: Value,
    ) -> Result<ChainOutcome, AppError> {
        let chain = self.routes.resolve(&conn.path, &event);
        let outcome = chain.run(conn, context, self.sink.clone()).await?;
        if let ChainOutcome::Aborted { index, kind } = outcome {
            debug!(
                "{} chain for {} aborted at handler {} ({:?})",
                event, conn.id, index, kind
            );
        }
        Ok(outcome)
    }

    /// Hand an error that arose outside any chain to the error sink
    pub async fn report(&self, conn: &Connection, error: AppError) {
        self.sink.report(conn, error).await;
    }

    /// Accept connections until the listener fails
    pub async fn serve(self, listener: TcpListener) -> Result<(), AppError> {
        info!("Dispatcher accepting on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    let dispatcher = self.clone();

                    // Spawn handler task for each connection
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, dispatcher).await {
                            error!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.routes)
            .field("outbound_buffer", &self.outbound_buffer)
            .finish()
    }
}
